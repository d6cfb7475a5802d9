//! Mirror orchestration: pull, push, or bidirectional synchronization
//! between the local store and a Smart-HTTP remote, with an explicit
//! conflict policy for refs that moved on both sides.

use crate::{
    errors::GitError,
    protocol::types::ServiceType,
    storage::ObjectStore,
    transport::client::HttpRemote,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorMode {
    Pull,
    Push,
    Bidir,
}

impl std::str::FromStr for MirrorMode {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull" => Ok(MirrorMode::Pull),
            "push" => Ok(MirrorMode::Push),
            "bidir" => Ok(MirrorMode::Bidir),
            other => Err(GitError::Conversion(format!("unknown mirror mode `{other}`"))),
        }
    }
}

/// What to do when a ref moved on both sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictPolicy {
    PreferLocal,
    PreferRemote,
    FastForwardOnly,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer-local" => Ok(ConflictPolicy::PreferLocal),
            "prefer-remote" => Ok(ConflictPolicy::PreferRemote),
            "fast-forward-only" => Ok(ConflictPolicy::FastForwardOnly),
            other => Err(GitError::Conversion(format!(
                "unknown conflict policy `{other}`"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub fetched_objects: usize,
    pub refs_pulled: usize,
    pub refs_pushed: usize,
    /// Refs left untouched by the conflict policy, with reasons.
    pub skipped: Vec<String>,
}

/// Synchronize `store` with `remote` according to `mode` and `policy`.
pub async fn mirror(
    store: &ObjectStore,
    remote: &HttpRemote,
    mode: MirrorMode,
    policy: ConflictPolicy,
) -> Result<MirrorReport, GitError> {
    let mut report = MirrorReport::default();

    if matches!(mode, MirrorMode::Pull | MirrorMode::Bidir) {
        let stats = remote.fetch(store, policy).await?;
        report.fetched_objects = stats.objects;
        report.refs_pulled = stats.refs_updated;
        if stats.refs_skipped > 0 {
            report
                .skipped
                .push(format!("{} refs kept local on pull", stats.refs_skipped));
        }
    }

    if matches!(mode, MirrorMode::Push | MirrorMode::Bidir) {
        // Push every local ref to its same name. With PreferLocal the push
        // overwrites diverged remotes only when the server accepts the CAS
        // (we re-read the advertisement inside push, so `old` is current).
        let advertisement = remote.advertise(ServiceType::ReceivePack).await?;
        let remote_map = advertisement.ref_map();
        let mut refspecs: Vec<(String, String)> = Vec::new();
        for (name, local_hash) in store.refs().list(None).await? {
            match (policy, remote_map.get(&name)) {
                (_, None) => refspecs.push((name.clone(), name)),
                (ConflictPolicy::PreferRemote, Some(remote_hash)) => {
                    if *remote_hash == local_hash {
                        continue;
                    }
                    report.skipped.push(format!("{name}: remote wins"));
                }
                (ConflictPolicy::PreferLocal, Some(_)) => {
                    refspecs.push((name.clone(), name));
                }
                (ConflictPolicy::FastForwardOnly, Some(_)) => {
                    // The server enforces fast-forward on its side; send
                    // the command and let report-status decide.
                    refspecs.push((name.clone(), name));
                }
            }
        }
        if !refspecs.is_empty() {
            let push = remote.push(store, &refspecs).await?;
            for (name, result) in &push.results {
                match result {
                    Ok(()) => report.refs_pushed += 1,
                    Err(reason) => report.skipped.push(format!("{name}: {reason}")),
                }
            }
        }
    }

    tracing::info!(
        mode = ?mode,
        pulled = report.refs_pulled,
        pushed = report.refs_pushed,
        skipped = report.skipped.len(),
        "mirror pass complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mode and policy strings parse as the CLI spells them.
    #[test]
    fn parse_mode_and_policy() {
        assert_eq!("pull".parse::<MirrorMode>().unwrap(), MirrorMode::Pull);
        assert_eq!("bidir".parse::<MirrorMode>().unwrap(), MirrorMode::Bidir);
        assert!("sideways".parse::<MirrorMode>().is_err());

        assert_eq!(
            "fast-forward-only".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::FastForwardOnly
        );
        assert!("coin-flip".parse::<ConflictPolicy>().is_err());
    }
}
