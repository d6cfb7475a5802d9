//! Smart-HTTP client: ref discovery, fetch negotiation, and send-pack
//! push, built on the same pkt-line and pack codecs the server uses.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use bytes::{Bytes, BytesMut};

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::pack::{decode::parse_pack, encode::encode_pack, entry::Entry},
    protocol::{
        pkt::{self, PktFrame},
        types::{AGENT, ServiceType, SideBand},
    },
    storage::{ObjectStore, graph},
    transport::mirror::ConflictPolicy,
};

/// One ref as advertised by the remote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteRef {
    pub name: String,
    pub hash: ObjectHash,
    pub peeled: Option<ObjectHash>,
}

/// Parsed `info/refs` advertisement.
#[derive(Clone, Debug, Default)]
pub struct Advertisement {
    pub refs: Vec<RemoteRef>,
    pub capabilities: Vec<String>,
    /// Target of `symref=HEAD:<name>` when the remote told us.
    pub head_symref: Option<String>,
}

impl Advertisement {
    pub fn ref_map(&self) -> HashMap<String, ObjectHash> {
        self.refs
            .iter()
            .map(|r| (r.name.clone(), r.hash))
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub objects: usize,
    pub refs_updated: usize,
    pub refs_skipped: usize,
}

#[derive(Clone, Debug, Default)]
pub struct PushReport {
    pub unpack_ok: bool,
    /// Per-ref outcome: `Ok` or the server's `ng` reason.
    pub results: Vec<(String, Result<(), String>)>,
}

impl PushReport {
    pub fn all_ok(&self) -> bool {
        self.unpack_ok && self.results.iter().all(|(_, r)| r.is_ok())
    }
}

/// A remote repository reached over Smart-HTTP.
pub struct HttpRemote {
    base: String,
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpRemote {
    /// `base` is the repository URL, e.g. `https://host/widgets`.
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self {
            base,
            client: reqwest::Client::new(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// `GET /info/refs?service=...` and parse the advertisement.
    pub async fn advertise(&self, service: ServiceType) -> Result<Advertisement, GitError> {
        let url = format!("{}/info/refs?service={service}", self.base);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| GitError::Transient(format!("GET {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(GitError::Transient(format!(
                "GET {url}: HTTP {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| GitError::Transient(e.to_string()))?;
        parse_advertisement(body, service)
    }

    async fn post(
        &self,
        service: ServiceType,
        body: Bytes,
    ) -> Result<Bytes, GitError> {
        let url = format!("{}/{service}", self.base);
        let response = self
            .authorize(self.client.post(&url))
            .header(
                "Content-Type",
                format!("application/x-{service}-request"),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| GitError::Transient(format!("POST {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(GitError::Transient(format!(
                "POST {url}: HTTP {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map_err(|e| GitError::Transient(e.to_string()))
    }

    /// Fetch from the remote into `store`, updating local refs per
    /// `policy`. An empty local store makes this a clone (HEAD symref
    /// installed from the advertisement).
    pub async fn fetch(
        &self,
        store: &ObjectStore,
        policy: ConflictPolicy,
    ) -> Result<FetchStats, GitError> {
        let advertisement = self.advertise(ServiceType::UploadPack).await?;
        let mut stats = FetchStats::default();

        let mut wants: Vec<ObjectHash> = Vec::new();
        for r in &advertisement.refs {
            if !store.has(&r.hash).await? && !wants.contains(&r.hash) {
                wants.push(r.hash);
            }
        }
        let haves: Vec<ObjectHash> = {
            let mut seen = HashSet::new();
            let mut haves = Vec::new();
            for (_, hash) in store.refs().list(None).await? {
                if seen.insert(hash) {
                    haves.push(hash);
                }
            }
            haves
        };

        if !wants.is_empty() {
            let mut body = BytesMut::new();
            for (i, want) in wants.iter().enumerate() {
                if i == 0 {
                    pkt::write_pkt_str(
                        &mut body,
                        &format!("want {want} side-band-64k ofs-delta thin-pack agent={AGENT}\n"),
                    );
                } else {
                    pkt::write_pkt_str(&mut body, &format!("want {want}\n"));
                }
            }
            pkt::write_flush(&mut body);
            for have in &haves {
                pkt::write_pkt_str(&mut body, &format!("have {have}\n"));
            }
            pkt::write_pkt_str(&mut body, "done\n");

            let response = self.post(ServiceType::UploadPack, body.freeze()).await?;
            let pack = demux_fetch_response(response)?;
            stats.objects = unpack_into(store, &pack).await?;
        }

        // Update local refs to the advertised targets.
        for r in &advertisement.refs {
            let current = store.refs().read_resolved(&r.name).await?;
            if current == Some(r.hash) {
                continue;
            }
            let update = match (&policy, current) {
                (_, None) => true,
                (ConflictPolicy::PreferRemote, Some(_)) => true,
                (ConflictPolicy::PreferLocal, Some(_)) => false,
                (ConflictPolicy::FastForwardOnly, Some(local)) => {
                    graph::is_ancestor(store, &local, &r.hash, 100_000).await?
                }
            };
            if update {
                store.refs().force_write(&r.name, &r.hash).await?;
                stats.refs_updated += 1;
            } else {
                tracing::debug!(r#ref = %r.name, "fetch skipped ref per conflict policy");
                stats.refs_skipped += 1;
            }
        }
        if let Some(symref) = &advertisement.head_symref {
            if store.refs().read("HEAD").await?.is_none() {
                store.refs().write_symbolic("HEAD", symref).await?;
            }
        }
        store.flush().await?;
        Ok(stats)
    }

    /// Push `refspecs` (local name, remote name) to the remote. A local
    /// ref that does not resolve deletes the remote one.
    pub async fn push(
        &self,
        store: &ObjectStore,
        refspecs: &[(String, String)],
    ) -> Result<PushReport, GitError> {
        let advertisement = self.advertise(ServiceType::ReceivePack).await?;
        let remote_map = advertisement.ref_map();

        let mut commands: Vec<(ObjectHash, ObjectHash, String)> = Vec::new();
        let mut push_targets: Vec<ObjectHash> = Vec::new();
        for (local, remote) in refspecs {
            let new = store
                .refs()
                .read_resolved(local)
                .await?
                .unwrap_or_else(ObjectHash::zero);
            let old = remote_map.get(remote).copied().unwrap_or_else(ObjectHash::zero);
            if new == old {
                continue;
            }
            if !new.is_zero() {
                push_targets.push(new);
            }
            commands.push((old, new, remote.clone()));
        }
        if commands.is_empty() {
            return Ok(PushReport {
                unpack_ok: true,
                results: Vec::new(),
            });
        }

        // Objects the remote already has (its advertised tips that exist
        // locally) bound the closure.
        let mut remote_tips: Vec<ObjectHash> = Vec::new();
        for hash in remote_map.values() {
            if store.has(hash).await? {
                remote_tips.push(*hash);
            }
        }
        let stop: HashSet<ObjectHash> =
            graph::reachable_closure(store, &remote_tips, &HashSet::new())
                .await?
                .into_keys()
                .collect();
        let closure = graph::reachable_closure(store, &push_targets, &stop).await?;
        let entries: Vec<Entry> = closure
            .into_iter()
            .map(|(hash, (obj_type, data))| Entry {
                obj_type,
                data: data.to_vec(),
                hash,
            })
            .collect();

        let mut body = BytesMut::new();
        for (i, (old, new, name)) in commands.iter().enumerate() {
            if i == 0 {
                pkt::write_pkt_str(
                    &mut body,
                    &format!("{old} {new} {name}\0report-status side-band-64k agent={AGENT}\n"),
                );
            } else {
                pkt::write_pkt_str(&mut body, &format!("{old} {new} {name}\n"));
            }
        }
        pkt::write_flush(&mut body);
        if !entries.is_empty() || commands.iter().any(|(_, new, _)| !new.is_zero()) {
            body.extend_from_slice(&encode_pack(&entries)?);
        }

        let response = self.post(ServiceType::ReceivePack, body.freeze()).await?;
        parse_push_report(response)
    }
}

fn parse_advertisement(body: Bytes, service: ServiceType) -> Result<Advertisement, GitError> {
    let mut buf = body;
    let mut advertisement = Advertisement::default();
    let mut first_ref = true;
    let banner = format!("# service={service}\n");

    let Some(PktFrame::Data(first)) = pkt::read_pkt_line(&mut buf)? else {
        return Err(GitError::MalformedPktLine("empty advertisement".to_string()));
    };
    if first.as_ref() != banner.as_bytes() {
        return Err(GitError::MalformedPktLine(format!(
            "advertisement must begin with `{}`",
            banner.trim_end()
        )));
    }

    while let Some(frame) = pkt::read_pkt_line(&mut buf)? {
        let PktFrame::Data(line) = frame else { continue };
        let (ref_part, caps) = match line.iter().position(|b| *b == 0) {
            Some(pos) => (
                line.slice(..pos),
                Some(String::from_utf8_lossy(&line[pos + 1..]).to_string()),
            ),
            None => (line.clone(), None),
        };
        if let Some(caps) = caps {
            for cap in caps.split_whitespace() {
                if let Some(symref) = cap.strip_prefix("symref=HEAD:") {
                    advertisement.head_symref = Some(symref.to_string());
                }
                advertisement.capabilities.push(cap.to_string());
            }
        }
        let text = String::from_utf8_lossy(&ref_part).trim_end().to_string();
        let Some((hash_hex, name)) = text.split_once(' ') else {
            return Err(GitError::MalformedPktLine(format!("ref line `{text}`")));
        };
        let hash = ObjectHash::from_str(hash_hex)?;

        if first_ref {
            first_ref = false;
            if name == "capabilities^{}" {
                continue; // empty repository
            }
        }
        if name == "HEAD" {
            continue; // HEAD is represented via head_symref
        }
        if let Some(peeled_name) = name.strip_suffix("^{}") {
            if let Some(entry) = advertisement
                .refs
                .iter_mut()
                .find(|r| r.name == peeled_name)
            {
                entry.peeled = Some(hash);
            }
            continue;
        }
        advertisement.refs.push(RemoteRef {
            name: name.to_string(),
            hash,
            peeled: None,
        });
    }
    Ok(advertisement)
}

/// Strip ACK/NAK lines and side-band framing from an upload-pack response,
/// returning the raw pack bytes.
fn demux_fetch_response(body: Bytes) -> Result<Vec<u8>, GitError> {
    let mut buf = body;
    let mut pack: Vec<u8> = Vec::new();
    let mut in_pack = false;
    loop {
        if !in_pack && buf.starts_with(b"PACK") {
            // Server did not side-band the pack.
            pack.extend_from_slice(&buf);
            return Ok(pack);
        }
        let Some(frame) = pkt::read_pkt_line(&mut buf)? else {
            break;
        };
        let PktFrame::Data(data) = frame else { continue };
        if data.is_empty() {
            continue;
        }
        if !in_pack {
            if data.as_ref() == b"NAK\n" || data.starts_with(b"ACK ") {
                continue;
            }
            if data.starts_with(b"ERR ") {
                return Err(GitError::Fatal(
                    String::from_utf8_lossy(&data[4..]).trim_end().to_string(),
                ));
            }
            in_pack = true;
        }
        let (channel, payload) = pkt::demux_side_band(data)?;
        match channel {
            SideBand::PackData => pack.extend_from_slice(&payload),
            SideBand::Progress => {
                tracing::debug!(progress = %String::from_utf8_lossy(&payload).trim_end(), "remote")
            }
            SideBand::Error => unreachable!("demux_side_band surfaces channel 3 as Err"),
        }
    }
    Ok(pack)
}

async fn unpack_into(store: &ObjectStore, pack: &[u8]) -> Result<usize, GitError> {
    if pack.is_empty() {
        return Ok(0);
    }
    let parsed = parse_pack(pack)?;
    let mut external = HashMap::new();
    for base in parsed.missing_bases() {
        if let Some((kind, data)) = store.get(&base).await? {
            external.insert(base, (kind, data.to_vec()));
        }
    }
    let entries = parsed.resolve(&external)?;
    let count = entries.len();
    for entry in entries {
        store.put(entry.obj_type, Bytes::from(entry.data)).await?;
    }
    Ok(count)
}

fn parse_push_report(body: Bytes) -> Result<PushReport, GitError> {
    // The report may arrive side-banded on channel 1.
    let mut outer = body;
    let mut inner = BytesMut::new();
    let mut side_banded = false;
    let mut plain = BytesMut::new();
    while let Some(frame) = pkt::read_pkt_line(&mut outer)? {
        let PktFrame::Data(data) = frame else { continue };
        if data.first() == Some(&SideBand::PackData.value()) {
            side_banded = true;
            inner.extend_from_slice(&data[1..]);
        } else if data.first() == Some(&SideBand::Error.value()) {
            return Err(GitError::Fatal(
                String::from_utf8_lossy(&data[1..]).trim_end().to_string(),
            ));
        } else {
            pkt::write_pkt_line(&mut plain, &data);
        }
    }
    let mut report_buf = if side_banded { inner.freeze() } else { plain.freeze() };

    let mut report = PushReport::default();
    let mut saw_unpack = false;
    while let Some(frame) = pkt::read_pkt_line(&mut report_buf)? {
        let PktFrame::Data(line) = frame else { continue };
        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        if let Some(rest) = text.strip_prefix("unpack ") {
            saw_unpack = true;
            report.unpack_ok = rest == "ok";
        } else if let Some(rest) = text.strip_prefix("ok ") {
            report.results.push((rest.to_string(), Ok(())));
        } else if let Some(rest) = text.strip_prefix("ng ") {
            let (name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
            report
                .results
                .push((name.to_string(), Err(reason.to_string())));
        }
    }
    if !saw_unpack {
        return Err(GitError::MalformedPktLine(
            "push response carried no status report".to_string(),
        ));
    }
    Ok(report)
}
