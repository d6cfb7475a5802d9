//! The Git smart protocol v1 state machine: ref advertisement, fetch
//! negotiation (`want`/`have`/ACK/NAK), receive-pack with report-status,
//! side-band multiplexing, and per-session caps with a cooperative
//! deadline.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use crate::{
    config::SessionLimits,
    hash::ObjectHash,
    internal::{
        object::types::ObjectType,
        pack::{decode::parse_pack, encode::encode_pack, entry::Entry},
    },
    protocol::{
        pkt::{self, PktFrame},
        types::{
            AdvertisedRef, Capability, ProtocolError, RefCommand, ServiceType, SideBand,
            receive_caps, upload_caps,
        },
    },
    storage::{ObjectStore, graph},
};

/// One smart-protocol session over a repository.
pub struct SmartProtocol {
    store: Arc<ObjectStore>,
    limits: SessionLimits,
    deadline: Instant,
    pub capabilities: Vec<Capability>,
    pub command_list: Vec<RefCommand>,
    pub push_options: Vec<String>,
}

/// Parsed upload-pack request body.
struct UploadRequest {
    wants: Vec<ObjectHash>,
    /// Rounds of `have` lines, split at flush boundaries.
    have_rounds: Vec<Vec<ObjectHash>>,
    done: bool,
    /// True when the last round was terminated by `done` itself rather
    /// than a flush: those haves get no per-have acknowledgment, only the
    /// final ACK/NAK.
    done_round: bool,
}

impl SmartProtocol {
    pub fn new(store: Arc<ObjectStore>, limits: SessionLimits) -> Self {
        let deadline = Instant::now() + std::time::Duration::from_millis(limits.deadline_ms);
        Self {
            store,
            limits,
            deadline,
            capabilities: Vec::new(),
            command_list: Vec::new(),
            push_options: Vec::new(),
        }
    }

    /// Cooperative cancellation: called at every suspension point.
    fn check_deadline(&self) -> Result<(), ProtocolError> {
        if Instant::now() >= self.deadline {
            Err(ProtocolError::Timeout("session deadline exceeded".into()))
        } else {
            Ok(())
        }
    }

    fn side_band_active(&self) -> bool {
        self.capabilities
            .iter()
            .any(|c| matches!(c, Capability::SideBand | Capability::SideBand64k))
    }

    fn progress_wanted(&self) -> bool {
        !self
            .capabilities
            .iter()
            .any(|c| matches!(c, Capability::NoProgress))
    }

    fn parse_capabilities(&mut self, cap_str: &str) {
        for cap in cap_str.split_whitespace() {
            if let Ok(capability) = cap.parse::<Capability>() {
                self.capabilities.push(capability);
            }
        }
    }

    /// Build the `info/refs` advertisement, service banner included.
    ///
    /// `HEAD` is advertised first with a `symref=` capability when
    /// symbolic; annotated tags get a peeled `^{}` line.
    pub async fn advertise_refs(&self, service: ServiceType) -> Result<BytesMut, ProtocolError> {
        self.check_deadline()?;
        let refs = self.store.refs().list(None).await?;
        let head_target = match self.store.refs().read("HEAD").await? {
            Some(crate::storage::refs::RefTarget::Symbolic(name)) => Some(name),
            _ => None,
        };
        let head_hash = self.store.refs().read_resolved("HEAD").await?;

        let mut advertised: Vec<AdvertisedRef> = Vec::new();
        for (name, hash) in refs {
            if name == "HEAD" {
                continue; // detached HEAD is covered by the HEAD line
            }
            let peeled = match self.store.get(&hash).await? {
                Some((ObjectType::Tag, data)) => {
                    use crate::internal::object::{ObjectTrait, tag::Tag};
                    Some(Tag::from_bytes(&data, hash)?.object_id)
                }
                _ => None,
            };
            advertised.push(AdvertisedRef { name, hash, peeled });
        }

        let mut caps = match service {
            ServiceType::UploadPack => upload_caps(),
            ServiceType::ReceivePack => receive_caps(),
        };
        if let Some(target) = &head_target {
            caps.push_str(&format!(" symref=HEAD:{target}"));
        }

        let mut out = BytesMut::new();
        pkt::write_pkt_str(&mut out, &format!("# service={service}\n"));
        pkt::write_flush(&mut out);

        // Capabilities ride the first advertised line: HEAD when it
        // resolves, else the first ref, else the capabilities^{}
        // placeholder of an empty repository.
        let mut caps_pending = Some(caps);
        if let Some(head) = head_hash {
            pkt::write_pkt_str(
                &mut out,
                &format!("{head} HEAD\0{}\n", caps_pending.take().unwrap()),
            );
        }
        for r in &advertised {
            match caps_pending.take() {
                Some(caps) => {
                    pkt::write_pkt_str(&mut out, &format!("{} {}\0{caps}\n", r.hash, r.name));
                }
                None => pkt::write_pkt_str(&mut out, &format!("{} {}\n", r.hash, r.name)),
            }
            if let Some(peeled) = r.peeled {
                pkt::write_pkt_str(&mut out, &format!("{peeled} {}^{{}}\n", r.name));
            }
        }
        if let Some(caps) = caps_pending {
            pkt::write_pkt_str(
                &mut out,
                &format!("{} capabilities^{{}}\0{caps}\n", ObjectHash::zero()),
            );
        }
        pkt::write_flush(&mut out);
        Ok(out)
    }

    fn parse_upload_request(&mut self, body: Bytes) -> Result<UploadRequest, ProtocolError> {
        if body.len() > self.limits.max_bytes_in {
            return Err(ProtocolError::CapacityExceeded(format!(
                "request of {} bytes exceeds max_bytes_in",
                body.len()
            )));
        }
        let mut buf = body;
        let mut wants = Vec::new();
        let mut have_rounds: Vec<Vec<ObjectHash>> = Vec::new();
        let mut current_round: Vec<ObjectHash> = Vec::new();
        let mut done = false;
        let mut done_round = false;
        let mut first_want = true;

        while let Some(frame) = pkt::read_pkt_line(&mut buf)? {
            let line = match frame {
                PktFrame::Flush => {
                    if !current_round.is_empty() {
                        if current_round.len() > self.limits.max_haves_per_round {
                            return Err(ProtocolError::CapacityExceeded(
                                "max_haves_per_round exceeded".into(),
                            ));
                        }
                        have_rounds.push(std::mem::take(&mut current_round));
                        if have_rounds.len() > self.limits.max_rounds {
                            return Err(ProtocolError::CapacityExceeded(
                                "max_rounds exceeded".into(),
                            ));
                        }
                    }
                    continue;
                }
                PktFrame::Delim => continue,
                PktFrame::Data(data) => data,
            };
            let text = std::str::from_utf8(&line)
                .map_err(|_| ProtocolError::invalid_request("non-UTF-8 request line"))?
                .trim_end_matches(['\n', '\r']);

            if let Some(rest) = text.strip_prefix("want ") {
                let (hash, caps) = split_hash_and_caps(rest)?;
                if first_want {
                    self.parse_capabilities(caps);
                    first_want = false;
                }
                wants.push(hash);
                if wants.len() > self.limits.max_wants {
                    return Err(ProtocolError::CapacityExceeded("max_wants exceeded".into()));
                }
            } else if let Some(rest) = text.strip_prefix("have ") {
                current_round.push(parse_wire_hash(rest)?);
            } else if text == "done" {
                done = true;
                if !current_round.is_empty() {
                    done_round = true;
                    have_rounds.push(std::mem::take(&mut current_round));
                }
                break;
            } else if text.starts_with("shallow ") || text.starts_with("deepen") {
                // Shallow negotiation is accepted but this server always
                // sends full history.
                tracing::debug!(line = text, "ignoring shallow/deepen request line");
            } else if !text.is_empty() {
                tracing::warn!(line = text, "unknown upload-pack command");
            }
        }
        if !current_round.is_empty() {
            have_rounds.push(current_round);
        }
        Ok(UploadRequest {
            wants,
            have_rounds,
            done,
            done_round,
        })
    }

    /// Handle a `git-upload-pack` POST body and produce the full response:
    /// ACK/NAK lines, then (after `done`) the pack, side-banded when
    /// negotiated.
    pub async fn upload_pack(&mut self, body: Bytes) -> Result<BytesMut, ProtocolError> {
        self.capabilities.clear();
        let request = self.parse_upload_request(body)?;
        let mut out = BytesMut::new();

        if request.wants.is_empty() {
            return Err(ProtocolError::invalid_request("no want lines"));
        }
        for want in &request.wants {
            self.check_deadline()?;
            if !self.store.has(want).await? {
                pkt::write_pkt_str(&mut out, &format!("ERR upload-pack: not our ref {want}\n"));
                return Ok(out);
            }
        }

        // ACK bookkeeping. Rounds answered before `done` acknowledge each
        // known have with `continue`; the final exchange reports
        // previously established commons and closes with ACK/NAK.
        let mut known_haves: Vec<ObjectHash> = Vec::new();
        let mut last_common: Option<ObjectHash> = None;
        let round_count = request.have_rounds.len();
        for (i, round) in request.have_rounds.iter().enumerate() {
            let final_round = request.done && request.done_round && i + 1 == round_count;
            let mut matched_this_round = false;
            for have in round {
                self.check_deadline()?;
                if self.store.has(have).await? {
                    known_haves.push(*have);
                    matched_this_round = true;
                    if !final_round {
                        pkt::write_pkt_str(&mut out, &format!("ACK {have} continue\n"));
                        last_common = Some(*have);
                    }
                }
            }
            if !final_round && !matched_this_round {
                pkt::write_pkt_str(&mut out, "NAK\n");
            }
        }

        if !request.done {
            // Stateless negotiation round: the client re-POSTs with more
            // haves (or done) next.
            if request.have_rounds.is_empty() {
                pkt::write_pkt_str(&mut out, "NAK\n");
            }
            return Ok(out);
        }

        for common in &known_haves {
            if Some(*common) == last_common {
                continue;
            }
            if last_common.is_some() {
                pkt::write_pkt_str(&mut out, &format!("ACK {common} common\n"));
            }
        }
        match last_common {
            Some(common) => pkt::write_pkt_str(&mut out, &format!("ACK {common}\n")),
            None => pkt::write_pkt_str(&mut out, "NAK\n"),
        }

        // wants − closure(haves)
        self.check_deadline()?;
        let have_closure = graph::reachable_closure(&self.store, &known_haves, &HashSet::new())
            .await?;
        let stop: HashSet<ObjectHash> = have_closure.into_keys().collect();
        let closure = graph::reachable_closure(&self.store, &request.wants, &stop).await?;
        self.check_deadline()?;

        let entries: Vec<Entry> = closure
            .into_iter()
            .map(|(hash, (obj_type, data))| Entry {
                obj_type,
                data: data.to_vec(),
                hash,
            })
            .collect();
        let count = entries.len();
        let pack = encode_pack(&entries).map_err(ProtocolError::from)?;

        if self.side_band_active() {
            if self.progress_wanted() {
                pkt::write_side_band(
                    &mut out,
                    SideBand::Progress,
                    format!("Enumerating objects: {count}, done.\n").as_bytes(),
                );
            }
            pkt::write_side_band(&mut out, SideBand::PackData, &pack);
            pkt::write_flush(&mut out);
        } else {
            out.extend_from_slice(&pack);
        }
        tracing::debug!(objects = count, "upload-pack response built");
        Ok(out)
    }

    /// Handle a `git-receive-pack` POST body: commands, optional push
    /// options, pack payload, ref CAS updates, report-status.
    pub async fn receive_pack(&mut self, body: Bytes) -> Result<BytesMut, ProtocolError> {
        if body.len() > self.limits.max_bytes_in {
            return Err(ProtocolError::CapacityExceeded(format!(
                "request of {} bytes exceeds max_bytes_in",
                body.len()
            )));
        }
        self.capabilities.clear();
        self.command_list.clear();
        self.push_options.clear();

        let mut buf = body;
        let mut first_line = true;
        let mut saw_flush = false;
        while let Some(frame) = pkt::read_pkt_line(&mut buf)? {
            let line = match frame {
                PktFrame::Flush => {
                    saw_flush = true;
                    break;
                }
                PktFrame::Delim => continue,
                PktFrame::Data(data) => data,
            };
            let (command_part, caps_part) = split_nul(&line);
            if first_line {
                if let Some(caps) = caps_part {
                    self.parse_capabilities(&caps);
                }
                first_line = false;
            }
            let text = std::str::from_utf8(&command_part)
                .map_err(|_| ProtocolError::invalid_request("non-UTF-8 command line"))?
                .trim_end_matches('\n');
            let mut fields = text.split(' ');
            let old = fields
                .next()
                .ok_or_else(|| ProtocolError::invalid_request("missing old hash"))?;
            let new = fields
                .next()
                .ok_or_else(|| ProtocolError::invalid_request("missing new hash"))?;
            let name = fields
                .next()
                .ok_or_else(|| ProtocolError::invalid_request("missing ref name"))?;
            if fields.next().is_some() {
                return Err(ProtocolError::invalid_request("trailing fields in command"));
            }
            self.command_list.push(RefCommand::new(
                parse_wire_hash(old)?,
                parse_wire_hash(new)?,
                name.to_string(),
            ));
        }
        if !saw_flush {
            return Err(ProtocolError::invalid_request(
                "missing flush before pack data",
            ));
        }
        if self.command_list.is_empty() {
            return Err(ProtocolError::invalid_request("no ref update commands"));
        }

        // Push options arrive between two flushes when negotiated.
        if self
            .capabilities
            .iter()
            .any(|c| matches!(c, Capability::PushOptions))
        {
            while let Some(frame) = pkt::read_pkt_line(&mut buf)? {
                match frame {
                    PktFrame::Flush => break,
                    PktFrame::Delim => continue,
                    PktFrame::Data(data) => {
                        self.push_options.push(
                            String::from_utf8_lossy(&data).trim_end_matches('\n').to_string(),
                        );
                    }
                }
            }
        }

        // Everything left is the pack. Absent for delete-only pushes.
        let unpack_result = if buf.is_empty() {
            Ok(0usize)
        } else {
            self.unpack_into_store(buf).await
        };

        let report_requested = self
            .capabilities
            .iter()
            .any(|c| matches!(c, Capability::ReportStatus));

        let unpack_line = match &unpack_result {
            Ok(_) => "unpack ok\n".to_string(),
            Err(e) => format!("unpack {e}\n"),
        };
        if unpack_result.is_err() {
            for command in &mut self.command_list {
                command.reject("unpacker error");
            }
        } else {
            self.apply_commands().await?;
            // Loose writes are done; refresh the packed snapshot.
            if let Err(e) = self.store.refs().pack_refs().await {
                tracing::warn!(error = %e, "packed-refs refresh failed");
            }
        }

        if !report_requested {
            return match unpack_result {
                Ok(_) => Ok(BytesMut::new()),
                Err(e) => Err(e),
            };
        }

        let mut report = BytesMut::new();
        pkt::write_pkt_str(&mut report, &unpack_line);
        for command in &self.command_list {
            pkt::write_pkt_str(&mut report, &format!("{}\n", command.status_line()));
        }
        pkt::write_flush(&mut report);

        let mut out = BytesMut::new();
        if self.side_band_active() {
            pkt::write_side_band(&mut out, SideBand::PackData, &report);
            pkt::write_flush(&mut out);
        } else {
            out = report;
        }
        Ok(out)
    }

    /// Decode the incoming pack (thin packs welcome) and store every
    /// object. The pack lands even when ref updates later fail: unreferenced
    /// objects age out through GC.
    async fn unpack_into_store(&self, pack: Bytes) -> Result<usize, ProtocolError> {
        self.check_deadline()?;
        let parsed = parse_pack(&pack).map_err(ProtocolError::from)?;
        let mut external = HashMap::new();
        for base in parsed.missing_bases() {
            if let Some((kind, data)) = self.store.get(&base).await? {
                external.insert(base, (kind, data.to_vec()));
            }
        }
        let entries = parsed.resolve(&external).map_err(ProtocolError::from)?;
        let count = entries.len();
        let mut needs_flush = false;
        for entry in entries {
            self.check_deadline()?;
            let outcome = self
                .store
                .put(entry.obj_type, Bytes::from(entry.data))
                .await?;
            needs_flush |= outcome.needs_flush;
        }
        if needs_flush {
            self.store.flush().await?;
        }
        tracing::debug!(objects = count, "receive-pack stored objects");
        Ok(count)
    }

    /// Validate a single command against the current refs; returns the
    /// rejection reason when it cannot apply.
    async fn validate_command(&self, command: &RefCommand) -> Result<Option<&'static str>, ProtocolError> {
        if !command.ref_name.starts_with("refs/") {
            return Ok(Some("invalid"));
        }
        if command.is_delete() {
            return Ok(None);
        }
        if !self.store.has(&command.new_hash).await? {
            return Ok(Some("invalid"));
        }
        if !command.is_create() {
            let ff = graph::is_ancestor(
                &self.store,
                &command.old_hash,
                &command.new_hash,
                100_000,
            )
            .await?;
            if !ff {
                return Ok(Some("non-fast-forward"));
            }
        }
        Ok(None)
    }

    async fn apply_commands(&mut self) -> Result<(), ProtocolError> {
        let atomic = self
            .capabilities
            .iter()
            .any(|c| matches!(c, Capability::Atomic));

        if atomic {
            let mut failure: Option<(usize, &'static str)> = None;
            for (i, command) in self.command_list.iter().enumerate() {
                if let Some(reason) = self.validate_command(command).await? {
                    failure = Some((i, reason));
                    break;
                }
            }
            if let Some((failed_index, reason)) = failure {
                for (i, command) in self.command_list.iter_mut().enumerate() {
                    if i == failed_index {
                        command.reject(reason);
                    } else {
                        command.reject("atomic transaction failed");
                    }
                }
                return Ok(());
            }
        }

        let mut commands = std::mem::take(&mut self.command_list);
        for command in &mut commands {
            self.check_deadline()?;
            match self.validate_command(command).await? {
                Some(reason) => command.reject(reason),
                None => {
                    let expected = if command.is_create() {
                        None
                    } else {
                        Some(&command.old_hash)
                    };
                    match self
                        .store
                        .refs()
                        .compare_and_swap(&command.ref_name, expected, &command.new_hash)
                        .await
                    {
                        Ok(()) => command.succeed(),
                        Err(e) => {
                            tracing::warn!(r#ref = %command.ref_name, error = %e, "ref update rejected");
                            command.reject(cas_reason(&e));
                        }
                    }
                }
            }
        }
        self.command_list = commands;
        Ok(())
    }
}

fn cas_reason(err: &crate::errors::GitError) -> &'static str {
    use crate::errors::ErrorKind;
    match err.kind() {
        ErrorKind::Conflict => "compare-and-swap conflict",
        ErrorKind::Permission => "forbidden",
        _ => "internal error",
    }
}

fn parse_wire_hash(s: &str) -> Result<ObjectHash, ProtocolError> {
    ObjectHash::from_str(s.trim())
        .map_err(|_| ProtocolError::invalid_request(&format!("bad hash `{}`", s.trim())))
}

/// Split `"<40-hex>[ caps...]"` into the hash and the capability tail.
fn split_hash_and_caps(rest: &str) -> Result<(ObjectHash, &str), ProtocolError> {
    match rest.split_once(' ') {
        Some((hash, caps)) => Ok((parse_wire_hash(hash)?, caps)),
        None => Ok((parse_wire_hash(rest)?, "")),
    }
}

fn split_nul(line: &[u8]) -> (Bytes, Option<String>) {
    match memchr::memchr(0, line) {
        Some(pos) => (
            Bytes::copy_from_slice(&line[..pos]),
            Some(String::from_utf8_lossy(&line[pos + 1..]).to_string()),
        ),
        None => (Bytes::copy_from_slice(line), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        internal::pack::decode::unpack,
        storage::{graph::test_repo::commit_with_file, test_support::memory_store},
    };

    fn session(store: &Arc<ObjectStore>) -> SmartProtocol {
        SmartProtocol::new(store.clone(), SessionLimits::default())
    }

    fn frames(buf: &BytesMut) -> Vec<PktFrame> {
        let mut bytes = Bytes::copy_from_slice(buf);
        pkt::read_all_pkt_lines(&mut bytes).unwrap()
    }

    fn data_lines(buf: &BytesMut) -> Vec<String> {
        frames(buf)
            .into_iter()
            .filter_map(|f| match f {
                PktFrame::Data(d) => Some(String::from_utf8_lossy(&d).to_string()),
                _ => None,
            })
            .collect()
    }

    /// Read the leading ACK/NAK/ERR pkt lines; returns them plus the byte
    /// offset where the raw (non-side-band) pack begins.
    fn ack_section(buf: &[u8]) -> (Vec<String>, usize) {
        let mut bytes = Bytes::copy_from_slice(buf);
        let mut consumed = 0usize;
        let mut lines = Vec::new();
        loop {
            let before = bytes.len();
            match pkt::read_pkt_line(&mut bytes) {
                Ok(Some(PktFrame::Data(d))) => {
                    let s = String::from_utf8_lossy(&d).to_string();
                    if !(s.starts_with("ACK") || s == "NAK\n" || s.starts_with("ERR")) {
                        return (lines, consumed);
                    }
                    consumed += before - bytes.len();
                    lines.push(s);
                }
                Ok(Some(_)) => consumed += before - bytes.len(),
                _ => return (lines, consumed),
            }
        }
    }

    /// Advertisement: banner, HEAD-first with capabilities and symref,
    /// then refs.
    #[tokio::test]
    async fn advertisement_layout() {
        let store = memory_store().await;
        let (c1, _, _) = commit_with_file(&store, "a", "1\n", vec![], "\nc1\n").await;
        store
            .refs()
            .compare_and_swap("refs/heads/main", None, &c1)
            .await
            .unwrap();
        store.refs().write_symbolic("HEAD", "refs/heads/main").await.unwrap();

        let smart = session(&store);
        let out = smart.advertise_refs(ServiceType::UploadPack).await.unwrap();
        assert!(out.starts_with(b"001e# service=git-upload-pack\n0000"));

        let lines = data_lines(&out);
        assert_eq!(lines[0], "# service=git-upload-pack\n");
        assert!(lines[1].starts_with(&format!("{c1} HEAD\0")));
        assert!(lines[1].contains("multi_ack_detailed"));
        assert!(lines[1].contains("side-band-64k"));
        assert!(lines[1].contains("symref=HEAD:refs/heads/main"));
        assert_eq!(lines[2], format!("{c1} refs/heads/main\n"));
    }

    /// Empty repository advertises the capabilities^{} placeholder.
    #[tokio::test]
    async fn advertisement_empty_repo() {
        let store = memory_store().await;
        let smart = session(&store);
        let out = smart.advertise_refs(ServiceType::ReceivePack).await.unwrap();
        let lines = data_lines(&out);
        assert!(lines[1].starts_with(&format!("{} capabilities^{{}}\0", ObjectHash::zero())));
        assert!(lines[1].contains("report-status"));
        assert!(lines[1].contains("delete-refs"));
        assert!(lines[1].contains("atomic"));
    }

    /// Annotated tags are advertised with a peeled ^{} line.
    #[tokio::test]
    async fn advertisement_peels_tags() {
        use crate::internal::object::{
            ObjectTrait,
            signature::{Signature, SignatureRole},
            tag::Tag,
        };
        let store = memory_store().await;
        let (c1, _, _) = commit_with_file(&store, "a", "1\n", vec![], "\nc1\n").await;
        store
            .refs()
            .compare_and_swap("refs/heads/main", None, &c1)
            .await
            .unwrap();
        store.refs().write_symbolic("HEAD", "refs/heads/main").await.unwrap();

        let tag = Tag::new(
            c1,
            ObjectType::Commit,
            "v1".to_string(),
            Signature::new(SignatureRole::Tagger, "t".into(), "t@e".into()),
            "release\n".to_string(),
        );
        store
            .put(ObjectType::Tag, Bytes::from(tag.to_data().unwrap()))
            .await
            .unwrap();
        store
            .refs()
            .compare_and_swap("refs/tags/v1", None, &tag.id)
            .await
            .unwrap();

        let smart = session(&store);
        let out = smart.advertise_refs(ServiceType::UploadPack).await.unwrap();
        let lines = data_lines(&out);
        assert!(lines.iter().any(|l| *l == format!("{} refs/tags/v1\n", tag.id)));
        assert!(lines.iter().any(|l| *l == format!("{c1} refs/tags/v1^{{}}\n")));
    }

    /// A full clone request (no haves): NAK, then a pack with the whole
    /// closure.
    #[tokio::test]
    async fn upload_pack_full_clone() {
        let store = memory_store().await;
        let (c1, _, _) = commit_with_file(&store, "a", "1\n", vec![], "\nc1\n").await;

        let mut body = BytesMut::new();
        pkt::write_pkt_str(&mut body, &format!("want {c1} side-band-64k\n"));
        pkt::write_flush(&mut body);
        pkt::write_pkt_str(&mut body, "done\n");

        let mut smart = session(&store);
        let out = smart.upload_pack(body.freeze()).await.unwrap();

        let mut pack = Vec::new();
        let mut saw_nak = false;
        for frame in frames(&out) {
            if let PktFrame::Data(d) = frame {
                if d.as_ref() == b"NAK\n" {
                    saw_nak = true;
                } else if d[0] == 1 {
                    pack.extend_from_slice(&d[1..]);
                }
            }
        }
        assert!(saw_nak);
        let entries = unpack(&pack).unwrap();
        assert_eq!(entries.len(), 3); // commit + tree + blob
        assert!(entries.iter().any(|e| e.hash == c1));
    }

    /// No-op fetch: haves cover the wants, answer is NAK plus an empty
    /// pack.
    #[tokio::test]
    async fn upload_pack_noop_fetch() {
        let store = memory_store().await;
        let (c1, _, _) = commit_with_file(&store, "a", "1\n", vec![], "\nc1\n").await;

        let mut body = BytesMut::new();
        pkt::write_pkt_str(&mut body, &format!("want {c1}\n"));
        pkt::write_flush(&mut body);
        pkt::write_pkt_str(&mut body, &format!("have {c1}\n"));
        pkt::write_pkt_str(&mut body, "done\n");

        let mut smart = session(&store);
        let out = smart.upload_pack(body.freeze()).await.unwrap();
        let (lines, consumed) = ack_section(&out);
        assert_eq!(lines, vec!["NAK\n"]);

        // no side-band requested: pack bytes follow the NAK raw
        let entries = unpack(&out[consumed..]).unwrap();
        assert!(entries.is_empty());
    }

    /// Incremental fetch ships only the delta of the closure.
    #[tokio::test]
    async fn upload_pack_incremental() {
        let store = memory_store().await;
        let (c1, _, _) = commit_with_file(&store, "a", "1\n", vec![], "\nc1\n").await;
        let (c2, _, _) = commit_with_file(&store, "a", "2\n", vec![c1], "\nc2\n").await;

        // round 1: have c1, no done → ACK continue
        let mut round1 = BytesMut::new();
        pkt::write_pkt_str(&mut round1, &format!("want {c2}\n"));
        pkt::write_flush(&mut round1);
        pkt::write_pkt_str(&mut round1, &format!("have {c1}\n"));
        pkt::write_flush(&mut round1);

        let mut smart = session(&store);
        let out = smart.upload_pack(round1.freeze()).await.unwrap();
        assert_eq!(data_lines(&out)[0], format!("ACK {c1} continue\n"));

        // round 2: same haves plus done → final ACK and the delta pack
        let mut round2 = BytesMut::new();
        pkt::write_pkt_str(&mut round2, &format!("want {c2}\n"));
        pkt::write_flush(&mut round2);
        pkt::write_pkt_str(&mut round2, &format!("have {c1}\n"));
        pkt::write_flush(&mut round2);
        pkt::write_pkt_str(&mut round2, "done\n");

        let mut smart = session(&store);
        let out = smart.upload_pack(round2.freeze()).await.unwrap();
        let (lines, consumed) = ack_section(&out);
        assert_eq!(lines[0], format!("ACK {c1} continue\n"));
        assert_eq!(lines[1], format!("ACK {c1}\n"));

        let entries = unpack(&out[consumed..]).unwrap();
        assert_eq!(entries.len(), 3); // c2's commit, tree, blob only
        assert!(entries.iter().any(|e| e.hash == c2));
        assert!(!entries.iter().any(|e| e.hash == c1));
    }

    /// Unknown wants produce a protocol-native ERR line.
    #[tokio::test]
    async fn upload_pack_unknown_want() {
        let store = memory_store().await;
        let ghost = ObjectHash::new(b"ghost");
        let mut body = BytesMut::new();
        pkt::write_pkt_str(&mut body, &format!("want {ghost}\n"));
        pkt::write_flush(&mut body);
        pkt::write_pkt_str(&mut body, "done\n");

        let mut smart = session(&store);
        let out = smart.upload_pack(body.freeze()).await.unwrap();
        assert!(data_lines(&out)[0].starts_with("ERR "));
    }

    /// Session caps: too many wants abort with a capacity error.
    #[tokio::test]
    async fn upload_pack_want_cap() {
        let store = memory_store().await;
        let (c1, _, _) = commit_with_file(&store, "a", "1\n", vec![], "\nc1\n").await;
        let mut limits = SessionLimits::default();
        limits.max_wants = 1;

        let mut body = BytesMut::new();
        pkt::write_pkt_str(&mut body, &format!("want {c1}\n"));
        pkt::write_pkt_str(&mut body, &format!("want {c1}\n"));
        pkt::write_flush(&mut body);
        pkt::write_pkt_str(&mut body, "done\n");

        let mut smart = SmartProtocol::new(store.clone(), limits);
        let err = smart.upload_pack(body.freeze()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::CapacityExceeded(_)));
    }

    /// Push of a new branch: unpack ok, ok ref line, ref visible after.
    #[tokio::test]
    async fn receive_pack_new_branch() {
        let store = memory_store().await;
        // Build the objects in a scratch store, pack them, push into the
        // real one.
        let scratch = memory_store().await;
        let (c2, _, _) = commit_with_file(&scratch, "f", "data\n", vec![], "\nc2\n").await;
        let closure = graph::reachable_closure(&scratch, &[c2], &HashSet::new())
            .await
            .unwrap();
        let entries: Vec<Entry> = closure
            .into_iter()
            .map(|(hash, (obj_type, data))| Entry {
                obj_type,
                data: data.to_vec(),
                hash,
            })
            .collect();
        let pack = encode_pack(&entries).unwrap();

        let mut body = BytesMut::new();
        pkt::write_pkt_str(
            &mut body,
            &format!(
                "{} {c2} refs/heads/feature\0report-status agent=git/2.39\n",
                ObjectHash::zero()
            ),
        );
        pkt::write_flush(&mut body);
        body.extend_from_slice(&pack);

        let mut smart = session(&store);
        let out = smart.receive_pack(body.freeze()).await.unwrap();
        let lines = data_lines(&out);
        assert_eq!(lines[0], "unpack ok\n");
        assert_eq!(lines[1], "ok refs/heads/feature\n");

        let listed = store.refs().list(Some("refs/heads/")).await.unwrap();
        assert_eq!(listed, vec![("refs/heads/feature".to_string(), c2)]);
        assert!(store.has(&c2).await.unwrap());
    }

    /// Non-fast-forward updates are rejected per-ref; the pack stays.
    #[tokio::test]
    async fn receive_pack_non_fast_forward() {
        let store = memory_store().await;
        let (c1, _, _) = commit_with_file(&store, "a", "1\n", vec![], "\nc1\n").await;
        let (c2, _, _) = commit_with_file(&store, "a", "2\n", vec![c1], "\nc2\n").await;
        store
            .refs()
            .compare_and_swap("refs/heads/main", None, &c2)
            .await
            .unwrap();

        // Try to move main back to c1 (not a descendant of c2).
        let mut body = BytesMut::new();
        pkt::write_pkt_str(
            &mut body,
            &format!("{c2} {c1} refs/heads/main\0report-status\n"),
        );
        pkt::write_flush(&mut body);

        let mut smart = session(&store);
        let out = smart.receive_pack(body.freeze()).await.unwrap();
        let lines = data_lines(&out);
        assert_eq!(lines[0], "unpack ok\n");
        assert_eq!(lines[1], "ng refs/heads/main non-fast-forward\n");
        assert_eq!(
            store.refs().read_resolved("refs/heads/main").await.unwrap(),
            Some(c2)
        );
    }

    /// Atomic pushes apply all or nothing.
    #[tokio::test]
    async fn receive_pack_atomic_all_or_nothing() {
        let store = memory_store().await;
        let (c1, _, _) = commit_with_file(&store, "a", "1\n", vec![], "\nc1\n").await;
        let ghost = ObjectHash::new(b"missing object");

        let mut body = BytesMut::new();
        pkt::write_pkt_str(
            &mut body,
            &format!(
                "{} {c1} refs/heads/one\0report-status atomic\n",
                ObjectHash::zero()
            ),
        );
        pkt::write_pkt_str(
            &mut body,
            &format!("{} {ghost} refs/heads/two\n", ObjectHash::zero()),
        );
        pkt::write_flush(&mut body);

        let mut smart = session(&store);
        let out = smart.receive_pack(body.freeze()).await.unwrap();
        let lines = data_lines(&out);
        assert_eq!(lines[0], "unpack ok\n");
        assert!(lines.contains(&"ng refs/heads/two invalid\n".to_string()));
        assert!(lines.contains(&"ng refs/heads/one atomic transaction failed\n".to_string()));
        assert!(store.refs().list(Some("refs/heads/")).await.unwrap().is_empty());
    }

    /// Ref deletion via the zero hash.
    #[tokio::test]
    async fn receive_pack_delete_ref() {
        let store = memory_store().await;
        let (c1, _, _) = commit_with_file(&store, "a", "1\n", vec![], "\nc1\n").await;
        store
            .refs()
            .compare_and_swap("refs/heads/gone", None, &c1)
            .await
            .unwrap();

        let mut body = BytesMut::new();
        pkt::write_pkt_str(
            &mut body,
            &format!("{c1} {} refs/heads/gone\0report-status\n", ObjectHash::zero()),
        );
        pkt::write_flush(&mut body);

        let mut smart = session(&store);
        let out = smart.receive_pack(body.freeze()).await.unwrap();
        assert_eq!(data_lines(&out)[1], "ok refs/heads/gone\n");
        assert!(store.refs().read("refs/heads/gone").await.unwrap().is_none());
    }

    /// Push options between the command flush and the pack are collected.
    #[tokio::test]
    async fn receive_pack_push_options() {
        let store = memory_store().await;
        let (c1, _, _) = commit_with_file(&store, "a", "1\n", vec![], "\nc1\n").await;

        let mut body = BytesMut::new();
        pkt::write_pkt_str(
            &mut body,
            &format!(
                "{} {c1} refs/heads/opt\0report-status push-options\n",
                ObjectHash::zero()
            ),
        );
        pkt::write_flush(&mut body);
        pkt::write_pkt_str(&mut body, "ci.skip\n");
        pkt::write_pkt_str(&mut body, "notify=none\n");
        pkt::write_flush(&mut body);

        let mut smart = session(&store);
        smart.receive_pack(body.freeze()).await.unwrap();
        assert_eq!(smart.push_options, vec!["ci.skip", "notify=none"]);
    }

    /// A missing flush between commands and pack is malformed.
    #[tokio::test]
    async fn receive_pack_missing_flush() {
        let store = memory_store().await;
        let (c1, _, _) = commit_with_file(&store, "a", "1\n", vec![], "\nc1\n").await;
        let mut body = BytesMut::new();
        pkt::write_pkt_str(
            &mut body,
            &format!("{} {c1} refs/heads/x\0report-status\n", ObjectHash::zero()),
        );

        let mut smart = session(&store);
        let err = smart.receive_pack(body.freeze()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRequest(_)));
    }
}
