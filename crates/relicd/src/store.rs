//! Content-addressed artifact store
//!
//! The `Repository` owns the durable artifact tables: immutable blobs
//! named by the SHA-1 of their content, optional delta encoding against a
//! base artifact, phantom placeholders for identifiers whose content has
//! not arrived, and the private/shun/unclustered/unsent bookkeeping the
//! sync engine runs on. All validation happens before the first write, so
//! a failed operation leaves no partial rows behind.

use crate::storage::{BlobRecord, RcvRecord, ShunRecord, Storage, StorageError};
use parking_lot::RwLock;
use reliquary_core::delta;
use reliquary_core::hash::artifact_id;
use reliquary_core::manifest::{Cluster, Manifest};
use reliquary_core::types::{ArtifactId, Rid};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

/// A stored delta must undercut the raw content by this many bytes.
pub const DELTA_MARGIN: usize = 50;

/// Cluster formation triggers above this many unclustered artifacts.
pub const CLUSTER_THRESHOLD: usize = 100;

/// Maximum members in one cluster artifact.
pub const CLUSTER_SIZE: usize = 800;

/// Artifact store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("hash mismatch: computed {computed} != transmitted {transmitted}")]
    HashMismatch { computed: String, transmitted: String },
    #[error("artifact {0} has no content")]
    Missing(Rid),
    #[error("delta chain through {0} is corrupt")]
    CorruptChain(Rid),
    #[error("artifact {0} is shunned")]
    ShunnedArtifact(ArtifactId),
    #[error("public artifact would depend on private base {0}")]
    PrivateDependency(Rid),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage full")]
    StorageFull,
}

type Result<T> = std::result::Result<T, StoreError>;

/// Seconds since the epoch as the store's timestamp type.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Handle to one repository. Cheap to clone; all clones share storage.
#[derive(Clone)]
pub struct Repository {
    storage: Arc<Storage>,
    /// Receipt id covering artifacts arriving in the current session
    rcvid: Arc<RwLock<i64>>,
}

impl Repository {
    /// Open (and if necessary initialize) a repository.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let storage = Arc::new(Storage::open(path)?);
        let repo = Self {
            storage,
            rcvid: Arc::new(RwLock::new(0)),
        };
        repo.init_meta()?;
        Ok(repo)
    }

    /// Wrap an already-open storage backend.
    pub fn with_storage(storage: Arc<Storage>) -> Result<Self> {
        let repo = Self {
            storage,
            rcvid: Arc::new(RwLock::new(0)),
        };
        repo.init_meta()?;
        Ok(repo)
    }

    fn init_meta(&self) -> Result<()> {
        for key in ["project-code", "server-code"] {
            if self.storage.get_meta(key)?.is_none() {
                let code = hex::encode(rand::random::<[u8; 20]>());
                self.storage.put_meta(key, &code)?;
            }
        }
        if self.storage.get_meta("content-schema")?.is_none() {
            self.storage.put_meta("content-schema", "1")?;
        }
        if self.storage.get_meta("aux-schema")?.is_none() {
            self.storage.put_meta("aux-schema", "1")?;
        }
        Ok(())
    }

    /// Shared storage handle for the cross-linker and sync engine.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Identity of this repository clone (portable across clones).
    pub fn project_code(&self) -> Result<String> {
        Ok(self.storage.get_meta("project-code")?.unwrap_or_default())
    }

    /// Identity of this particular copy.
    pub fn server_code(&self) -> Result<String> {
        Ok(self.storage.get_meta("server-code")?.unwrap_or_default())
    }

    /// Adopt a project code (initial clone).
    pub fn set_project_code(&self, code: &str) -> Result<()> {
        self.storage.put_meta("project-code", code)?;
        Ok(())
    }

    /// Open a receipt covering artifacts that arrive in this session.
    pub fn begin_receipt(&self, uid: &str, ipaddr: &str, nonce: &str) -> Result<i64> {
        let rcvid = self.storage.add_rcv(&RcvRecord {
            uid: uid.into(),
            mtime: unix_now(),
            ipaddr: ipaddr.into(),
            nonce: nonce.into(),
        })?;
        *self.rcvid.write() = rcvid;
        Ok(rcvid)
    }

    // -- core operations ---------------------------------------------------

    /// Store an artifact.
    ///
    /// `content` is raw bytes, or delta bytes when `src` names a base
    /// artifact. A phantom with the same identifier is materialized in
    /// place. Returns the rid; storing the same content twice is a no-op.
    pub fn put(
        &self,
        content: &[u8],
        uuid: Option<ArtifactId>,
        src: Option<Rid>,
        private: bool,
    ) -> Result<Rid> {
        // resolve the full content first: every check below runs against
        // the real bytes, before anything is written
        let full = match src {
            Some(base_rid) => {
                let base = self.get(base_rid)?;
                delta::apply(&base, content).map_err(|_| StoreError::CorruptChain(base_rid))?
            }
            None => content.to_vec(),
        };
        let computed = artifact_id(&full);
        if let Some(claimed) = uuid {
            if claimed != computed {
                return Err(StoreError::HashMismatch {
                    computed: computed.to_hex(),
                    transmitted: claimed.to_hex(),
                });
            }
        }
        if self.storage.is_shunned(&computed)? {
            return Err(StoreError::ShunnedArtifact(computed));
        }
        if let Some(base_rid) = src {
            if !private && self.storage.is_private(base_rid)? {
                return Err(StoreError::PrivateDependency(base_rid));
            }
        }

        let rid = match self.storage.rid_for_uuid(&computed)? {
            Some(existing) => {
                let record = self
                    .storage
                    .get_blob(existing)?
                    .ok_or(StoreError::Missing(existing))?;
                if !record.is_phantom() {
                    return Ok(existing);
                }
                debug!(rid = existing.0, uuid = %computed, "materializing phantom");
                existing
            }
            None => self.storage.alloc_rid()?,
        };

        self.storage.put_blob(
            rid,
            &BlobRecord {
                uuid: computed,
                size: full.len() as i64,
                rcvid: *self.rcvid.read(),
            },
        )?;
        match src {
            Some(base_rid) => {
                self.storage.put_content(rid, content)?;
                self.storage.set_delta(rid, base_rid)?;
            }
            None => {
                self.storage.put_content(rid, &full)?;
                self.storage.clear_delta(rid)?;
            }
        }
        if private {
            self.storage.add_private(rid)?;
        } else {
            self.storage.add_unclustered(rid)?;
            self.storage.add_unsent(rid)?;
        }
        Ok(rid)
    }

    /// Reconstruct an artifact's content, walking the delta chain.
    pub fn get(&self, rid: Rid) -> Result<Vec<u8>> {
        let limit = self.storage.blob_count() + 1;
        let mut chain = Vec::new();
        let mut cur = rid;
        loop {
            let record = self
                .storage
                .get_blob(cur)?
                .ok_or(StoreError::Missing(cur))?;
            if record.is_phantom() {
                return Err(StoreError::Missing(cur));
            }
            chain.push(cur);
            if chain.len() > limit {
                // longer than the artifact count: the chain must loop
                return Err(StoreError::CorruptChain(rid));
            }
            match self.storage.delta_src(cur)? {
                Some(src) => cur = src,
                None => break,
            }
        }

        let base_rid = *chain.last().expect("chain is non-empty");
        let mut content = self
            .storage
            .get_content(base_rid)?
            .ok_or(StoreError::CorruptChain(base_rid))?;
        for &link in chain[..chain.len() - 1].iter().rev() {
            let delta_bytes = self
                .storage
                .get_content(link)?
                .ok_or(StoreError::CorruptChain(link))?;
            content =
                delta::apply(&content, &delta_bytes).map_err(|_| StoreError::CorruptChain(link))?;
        }
        Ok(content)
    }

    /// Uncompressed size, or None for phantoms and unknown rids.
    pub fn content_size(&self, rid: Rid) -> Result<Option<i64>> {
        Ok(self
            .storage
            .get_blob(rid)?
            .filter(|r| !r.is_phantom())
            .map(|r| r.size))
    }

    /// True when the rid exists and its content is present.
    pub fn content_available(&self, rid: Rid) -> Result<bool> {
        Ok(self
            .storage
            .get_blob(rid)?
            .map(|r| !r.is_phantom())
            .unwrap_or(false))
    }

    /// Identifier of a rid, if known.
    pub fn uuid_of(&self, rid: Rid) -> Result<Option<ArtifactId>> {
        Ok(self.storage.get_blob(rid)?.map(|r| r.uuid))
    }

    /// Create a placeholder row for an identifier whose content is
    /// missing. Returns the existing rid when the identifier is known.
    pub fn new_phantom(&self, uuid: ArtifactId, private: bool) -> Result<Rid> {
        if self.storage.is_shunned(&uuid)? {
            return Err(StoreError::ShunnedArtifact(uuid));
        }
        if let Some(existing) = self.storage.rid_for_uuid(&uuid)? {
            return Ok(existing);
        }
        let rid = self.storage.alloc_rid()?;
        self.storage.put_blob(
            rid,
            &BlobRecord {
                uuid,
                size: -1,
                rcvid: *self.rcvid.read(),
            },
        )?;
        if private {
            self.storage.add_private(rid)?;
        }
        Ok(rid)
    }

    /// Rid for an identifier, creating a phantom when unknown.
    pub fn ensure_rid(&self, uuid: ArtifactId, private: bool) -> Result<Rid> {
        match self.storage.rid_for_uuid(&uuid)? {
            Some(rid) => Ok(rid),
            None => self.new_phantom(uuid, private),
        }
    }

    // -- private set -------------------------------------------------------

    pub fn is_private(&self, rid: Rid) -> Result<bool> {
        Ok(self.storage.is_private(rid)?)
    }

    /// Move an artifact to the public set. Fails while the artifact is
    /// still a delta over a private base, which publishing would leak.
    pub fn make_public(&self, rid: Rid) -> Result<()> {
        let limit = self.storage.blob_count() + 1;
        let mut cur = rid;
        let mut depth = 0;
        while let Some(src) = self.storage.delta_src(cur)? {
            if self.storage.is_private(src)? {
                return Err(StoreError::PrivateDependency(src));
            }
            depth += 1;
            if depth > limit {
                return Err(StoreError::CorruptChain(rid));
            }
            cur = src;
        }
        if self.storage.is_private(rid)? {
            self.storage.remove_private(rid)?;
            self.storage.add_unclustered(rid)?;
            self.storage.add_unsent(rid)?;
        }
        Ok(())
    }

    /// Re-store an artifact as full content rather than a delta.
    pub fn undelta(&self, rid: Rid) -> Result<()> {
        if self.storage.delta_src(rid)?.is_none() {
            return Ok(());
        }
        let content = self.get(rid)?;
        self.storage.put_content(rid, &content)?;
        self.storage.clear_delta(rid)?;
        Ok(())
    }

    /// Remove all private artifacts, first rewriting any public delta
    /// that uses one as its base.
    pub fn delete_private_content(&self) -> Result<()> {
        let privates: Vec<Rid> = self.iter_private()?;
        for &rid in &privates {
            for dep in self.storage.deltas_from(rid)? {
                if !self.storage.is_private(dep)? {
                    self.undelta(dep)?;
                }
            }
        }
        for &rid in &privates {
            if let Some(record) = self.storage.get_blob(rid)? {
                self.storage.remove_blob(rid, &record.uuid)?;
                self.storage.remove_event(rid)?;
            }
        }
        info!(count = privates.len(), "deleted private content");
        Ok(())
    }

    // -- shun --------------------------------------------------------------

    /// Ban an identifier. Existing content is removed; deltas that used
    /// it as a base are rewritten as full content first.
    pub fn shun(&self, uuid: ArtifactId, comment: &str) -> Result<()> {
        if let Some(rid) = self.storage.rid_for_uuid(&uuid)? {
            for dep in self.storage.deltas_from(rid)? {
                self.undelta(dep)?;
            }
            self.storage.remove_blob(rid, &uuid)?;
            self.storage.remove_event(rid)?;
        }
        self.storage.add_shun(
            &uuid,
            &ShunRecord {
                mtime: unix_now(),
                scom: comment.into(),
            },
        )?;
        info!(uuid = %uuid, "shunned artifact");
        Ok(())
    }

    pub fn unshun(&self, uuid: &ArtifactId) -> Result<()> {
        self.storage.remove_shun(uuid)?;
        Ok(())
    }

    pub fn is_shunned(&self, uuid: &ArtifactId) -> Result<bool> {
        Ok(self.storage.is_shunned(uuid)?)
    }

    // -- set iteration -----------------------------------------------------

    pub fn iter_phantoms(&self) -> Result<Vec<Rid>> {
        self.storage
            .iter_phantoms()
            .map(|r| r.map_err(StoreError::from))
            .collect()
    }

    pub fn iter_private(&self) -> Result<Vec<Rid>> {
        self.storage
            .iter_private()
            .map(|r| r.map_err(StoreError::from))
            .collect()
    }

    pub fn iter_unclustered(&self) -> Result<Vec<Rid>> {
        self.storage
            .iter_unclustered()
            .map(|r| r.map_err(StoreError::from))
            .collect()
    }

    pub fn iter_unsent(&self) -> Result<Vec<Rid>> {
        self.storage
            .iter_unsent()
            .map(|r| r.map_err(StoreError::from))
            .collect()
    }

    // -- clusters ----------------------------------------------------------

    /// Seal unclustered artifacts into cluster artifacts once there are
    /// enough of them. Phantoms and private artifacts never enter a
    /// cluster. Returns the rids of any clusters created.
    pub fn form_clusters(&self) -> Result<Vec<Rid>> {
        let mut candidates = Vec::new();
        for rid in self.iter_unclustered()? {
            let Some(record) = self.storage.get_blob(rid)? else {
                continue;
            };
            if record.is_phantom() || self.storage.is_private(rid)? {
                continue;
            }
            candidates.push((rid, record.uuid));
        }
        if candidates.len() <= CLUSTER_THRESHOLD {
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        for chunk in candidates.chunks(CLUSTER_SIZE) {
            let mut members: Vec<ArtifactId> = chunk.iter().map(|(_, uuid)| *uuid).collect();
            members.sort();
            let cluster = Manifest::Cluster(Cluster { members });
            let rid = self.put(&cluster.to_bytes(), None, None, false)?;
            for (member, _) in chunk {
                self.storage.remove_unclustered(*member)?;
            }
            debug!(rid = rid.0, members = chunk.len(), "sealed cluster");
            created.push(rid);
        }
        Ok(created)
    }

    // -- delta policy ------------------------------------------------------

    /// Pick a base artifact to delta against when sending `rid`.
    ///
    /// Preference order: an existing delta edge, then the primary parent
    /// checkin, then the file's previous appearance. A shunned or (for a
    /// public artifact) private base disqualifies the candidate.
    pub fn delta_source(&self, rid: Rid) -> Result<Option<Rid>> {
        let mut candidates = Vec::new();
        if let Some(src) = self.storage.delta_src(rid)? {
            candidates.push(src);
        }
        if let Some(parent) = self.storage.primary_parent(rid)? {
            candidates.push(parent);
        }
        if let Some(pid) = self.storage.find_mlink_pid(rid.0)? {
            candidates.push(Rid(pid));
        }
        let private_target = self.storage.is_private(rid)?;
        for cand in candidates {
            if cand == rid || !self.content_available(cand)? {
                continue;
            }
            if !private_target && self.storage.is_private(cand)? {
                continue;
            }
            return Ok(Some(cand));
        }
        Ok(None)
    }

    /// A delta is stored/sent only when it beats raw content by
    /// [`DELTA_MARGIN`] bytes.
    pub fn delta_is_profitable(delta_len: usize, raw_len: usize) -> bool {
        delta_len + DELTA_MARGIN <= raw_len
    }

    /// Flush storage to disk.
    pub fn flush(&self) -> Result<()> {
        self.storage.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reliquary_core::delta::compute;
    use tempfile::tempdir;

    fn test_repo() -> (Repository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (Repository::open(dir.path()).unwrap(), dir)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (repo, _dir) = test_repo();
        let rid = repo.put(b"hello artifact", None, None, false).unwrap();
        assert_eq!(repo.get(rid).unwrap(), b"hello artifact");
        assert_eq!(
            repo.uuid_of(rid).unwrap().unwrap(),
            artifact_id(b"hello artifact")
        );
        // idempotent
        assert_eq!(repo.put(b"hello artifact", None, None, false).unwrap(), rid);
    }

    #[test]
    fn test_put_verifies_claimed_uuid() {
        let (repo, _dir) = test_repo();
        let wrong = artifact_id(b"something else");
        let err = repo.put(b"content", Some(wrong), None, false).unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
        // nothing was stored
        assert!(repo.storage().rid_for_uuid(&wrong).unwrap().is_none());
    }

    #[test]
    fn test_phantom_materialization() {
        let (repo, _dir) = test_repo();
        let uuid = artifact_id(b"later content");
        let phantom = repo.new_phantom(uuid, false).unwrap();
        assert!(matches!(repo.get(phantom), Err(StoreError::Missing(_))));

        let rid = repo.put(b"later content", Some(uuid), None, false).unwrap();
        assert_eq!(rid, phantom);
        assert_eq!(repo.get(rid).unwrap(), b"later content");
        assert!(repo.iter_phantoms().unwrap().is_empty());
    }

    #[test]
    fn test_delta_storage_roundtrip() {
        let (repo, _dir) = test_repo();
        let base_content = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let mut target_content = base_content.clone();
        target_content.extend_from_slice(b" -- amended");

        let base = repo.put(&base_content, None, None, false).unwrap();
        let delta = compute(&base_content, &target_content);
        let target = repo.put(&delta, None, Some(base), false).unwrap();

        assert_eq!(repo.get(target).unwrap(), target_content);
        assert_eq!(repo.storage().delta_src(target).unwrap(), Some(base));
        assert_eq!(
            repo.uuid_of(target).unwrap().unwrap(),
            artifact_id(&target_content)
        );
    }

    #[test]
    fn test_delta_cycle_detected() {
        let (repo, _dir) = test_repo();
        let a = repo.put(b"artifact a content", None, None, false).unwrap();
        let b = repo.put(b"artifact b content", None, None, false).unwrap();
        // corrupt the edges directly into a loop
        repo.storage().set_delta(a, b).unwrap();
        repo.storage().set_delta(b, a).unwrap();
        assert!(matches!(repo.get(a), Err(StoreError::CorruptChain(_))));
    }

    #[test]
    fn test_shun_refuses_and_removes() {
        let (repo, _dir) = test_repo();
        let rid = repo.put(b"banned bytes", None, None, false).unwrap();
        let uuid = repo.uuid_of(rid).unwrap().unwrap();

        repo.shun(uuid, "spam").unwrap();
        assert!(repo.storage().rid_for_uuid(&uuid).unwrap().is_none());
        assert!(matches!(
            repo.put(b"banned bytes", None, None, false),
            Err(StoreError::ShunnedArtifact(_))
        ));
        assert!(matches!(
            repo.new_phantom(uuid, false),
            Err(StoreError::ShunnedArtifact(_))
        ));
    }

    #[test]
    fn test_public_delta_over_private_base_rejected() {
        let (repo, _dir) = test_repo();
        let base_content = b"private base content that is long enough to delta".repeat(5);
        let base = repo.put(&base_content, None, None, true).unwrap();
        assert!(repo.is_private(base).unwrap());

        let mut target = base_content.clone();
        target.extend_from_slice(b"public tail");
        let delta = compute(&base_content, &target);
        assert!(matches!(
            repo.put(&delta, None, Some(base), false),
            Err(StoreError::PrivateDependency(_))
        ));
        // private-over-private is fine
        assert!(repo.put(&delta, None, Some(base), true).is_ok());
    }

    #[test]
    fn test_make_public_checks_chain() {
        let (repo, _dir) = test_repo();
        let base_content = b"base held private for now, long enough to bother".repeat(4);
        let base = repo.put(&base_content, None, None, true).unwrap();
        let mut target = base_content.clone();
        target.extend_from_slice(b"derived");
        let delta = compute(&base_content, &target);
        let derived = repo.put(&delta, None, Some(base), true).unwrap();

        assert!(matches!(
            repo.make_public(derived),
            Err(StoreError::PrivateDependency(_))
        ));
        repo.make_public(base).unwrap();
        repo.make_public(derived).unwrap();
        assert!(!repo.is_private(derived).unwrap());
    }

    #[test]
    fn test_delete_private_content_preserves_public() {
        let (repo, _dir) = test_repo();
        let base_content = b"shared history that public artifacts delta against".repeat(6);
        let base = repo.put(&base_content, None, None, true).unwrap();
        let mut target = base_content.clone();
        target.extend_from_slice(b"public continuation");
        let delta = compute(&base_content, &target);
        // inbound private delta later published
        let public = repo.put(&delta, None, Some(base), true).unwrap();
        repo.make_public(base).unwrap();
        repo.make_public(public).unwrap();
        // re-privatize the base only, then scrub
        repo.storage().add_private(base).unwrap();
        repo.delete_private_content().unwrap();

        assert_eq!(repo.get(public).unwrap(), target);
        assert!(repo.storage().delta_src(public).unwrap().is_none());
        assert!(repo.storage().get_blob(base).unwrap().is_none());
    }

    #[test]
    fn test_cluster_formation() {
        let (repo, _dir) = test_repo();
        let mut rids = Vec::new();
        for i in 0..150u32 {
            let content = format!("artifact number {}", i);
            rids.push(repo.put(content.as_bytes(), None, None, false).unwrap());
        }
        assert_eq!(repo.iter_unclustered().unwrap().len(), 150);

        let clusters = repo.form_clusters().unwrap();
        assert_eq!(clusters.len(), 1);

        // every original artifact left the unclustered set; only the new
        // cluster rid remains
        let unclustered = repo.iter_unclustered().unwrap();
        assert_eq!(unclustered, clusters);

        // the cluster body names all 150 members
        let bytes = repo.get(clusters[0]).unwrap();
        match Manifest::parse(&bytes).unwrap() {
            Manifest::Cluster(c) => assert_eq!(c.members.len(), 150),
            other => panic!("unexpected variant {}", other.kind()),
        }
    }

    #[test]
    fn test_undelta_materializes() {
        let (repo, _dir) = test_repo();
        let base_content = b"undelta base material, sufficiently long to matter".repeat(4);
        let base = repo.put(&base_content, None, None, false).unwrap();
        let mut target = base_content.clone();
        target.extend_from_slice(b"tail");
        let delta = compute(&base_content, &target);
        let rid = repo.put(&delta, None, Some(base), false).unwrap();

        repo.undelta(rid).unwrap();
        assert!(repo.storage().delta_src(rid).unwrap().is_none());
        assert_eq!(repo.get(rid).unwrap(), target);
    }
}
