//! Derived-index maintenance
//!
//! Every control artifact stored in the repository flows through
//! [`Crosslinker::crosslink`], which parses it and updates the derived
//! tables: parent/child edges, per-checkin file changes, tag assignments,
//! wiki/ticket/attachment state, and the timeline. Derived rows are a
//! cache over the artifact set; [`Crosslinker::rebuild`] reconstructs all
//! of them from scratch and arrives at the same state as the incremental
//! path.
//!
//! Ticket state accumulates across artifacts, so ticket processing is
//! deferred to the end of a batch, followed by the timestamp-fudge pass
//! that keeps parent/child display times monotonic.

use crate::storage::{
    AttachRecord, EventRecord, EventType, MlinkRecord, PlinkRecord, StorageError, TagType,
    TagxrefRecord, TicketRecord,
};
use crate::store::{Repository, StoreError};
use parking_lot::Mutex;
use reliquary_core::manifest::{
    parse_date, Attachment, Checkin, Cluster, Control, Event, Manifest, TagCard, TagScope,
    TagTarget, Ticket, Wiki,
};
use reliquary_core::types::{ArtifactId, FileEntry, Rid};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use thiserror::Error;
use tracing::{debug, warn};

/// Display-time nudge applied per fudge round.
pub const FUDGE_STEP: f64 = 0.025;

/// Parent/child pairs further apart than this are left alone.
pub const FUDGE_WINDOW: f64 = 2.0;

/// Bound on fudge rounds for one pair.
pub const FUDGE_ROUNDS: u32 = 30;

/// The well-known propagating tag that moves branch membership.
pub const TAG_BRANCH: &str = "branch";

/// The well-known tag that overrides a checkin's displayed date.
pub const TAG_DATE: &str = "date";

/// Cross-link errors. Manifest parse failures are not errors: the
/// artifact stays stored as opaque content and is skipped.
#[derive(Debug, Error)]
pub enum CrosslinkError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

type Result<T> = std::result::Result<T, CrosslinkError>;

/// Priority-queue entry ordered by mtime, rid as tiebreak.
struct ByMtime(f64, Rid);

impl PartialEq for ByMtime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for ByMtime {}
impl PartialOrd for ByMtime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ByMtime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0).then(self.1.cmp(&other.1))
    }
}

#[derive(Default)]
struct BatchState {
    depth: u32,
    pending_tickets: BTreeSet<ArtifactId>,
    touched: Vec<Rid>,
}

/// Maintains the derived tables for one repository.
pub struct Crosslinker {
    repo: Repository,
    state: Mutex<BatchState>,
}

impl Crosslinker {
    pub fn new(repo: Repository) -> Self {
        Self {
            repo,
            state: Mutex::new(BatchState::default()),
        }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Open a batch scope. Ticket rebuilds and the fudge pass run when
    /// the outermost scope closes.
    pub fn crosslink_begin(&self) {
        self.state.lock().depth += 1;
    }

    /// Close a batch scope.
    pub fn crosslink_end(&self) -> Result<()> {
        let (tickets, touched) = {
            let mut st = self.state.lock();
            st.depth = st.depth.saturating_sub(1);
            if st.depth > 0 {
                return Ok(());
            }
            (
                std::mem::take(&mut st.pending_tickets),
                std::mem::take(&mut st.touched),
            )
        };
        for ticket_id in &tickets {
            self.rebuild_ticket(ticket_id)?;
        }
        self.fudge_timestamps(&touched)?;
        Ok(())
    }

    /// Cross-link one artifact. Safe to call repeatedly; the derived
    /// rows come out the same.
    pub fn crosslink(&self, rid: Rid) -> Result<()> {
        self.crosslink_begin();
        let linked = self.link(rid);
        let ended = self.crosslink_end();
        linked.and(ended)
    }

    /// Drop and reconstruct every derived table from the artifact set.
    pub fn rebuild(&self) -> Result<()> {
        let storage = self.repo.storage();
        storage.clear_derived()?;
        let mut rids = Vec::new();
        for item in storage.iter_blobs() {
            let (rid, record) = item.map_err(StorageError::from)?;
            if !record.is_phantom() {
                rids.push(rid);
            }
        }
        self.crosslink_begin();
        let mut linked = Ok(());
        for rid in rids {
            if let Err(err) = self.link(rid) {
                linked = Err(err);
                break;
            }
        }
        let ended = self.crosslink_end();
        linked.and(ended)
    }

    fn link(&self, rid: Rid) -> Result<()> {
        let content = match self.repo.get(rid) {
            Ok(content) => content,
            // phantoms have nothing to link yet
            Err(StoreError::Missing(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let manifest = match Manifest::parse(&content) {
            Ok(manifest) => manifest,
            Err(err) => {
                debug!(rid = rid.0, %err, "artifact is not a control artifact");
                return Ok(());
            }
        };
        match &manifest {
            Manifest::Checkin(m) => self.link_checkin(rid, m)?,
            Manifest::Cluster(m) => self.link_cluster(m)?,
            Manifest::Control(m) => self.link_control(rid, m)?,
            Manifest::Wiki(m) => self.link_wiki(rid, m)?,
            Manifest::Ticket(m) => self.link_ticket(rid, m)?,
            Manifest::Attachment(m) => self.link_attachment(rid, m)?,
            Manifest::Event(m) => self.link_event(rid, m)?,
        }

        // deltas that were waiting on this artifact as their baseline
        for orphan in self.repo.storage().take_orphans_of(rid)? {
            self.relink_mlinks(orphan)?;
            for (child, _) in self.repo.storage().children_of(orphan)? {
                self.relink_mlinks(child)?;
            }
        }
        Ok(())
    }

    // -- checkins ----------------------------------------------------------

    fn link_checkin(&self, rid: Rid, m: &Checkin) -> Result<()> {
        let private = self.repo.is_private(rid)?;
        let storage = self.repo.storage();

        for (idx, parent_uuid) in m.parents.iter().enumerate() {
            let parent = self.repo.ensure_rid(*parent_uuid, private)?;
            storage.put_plink(
                parent,
                rid,
                &PlinkRecord {
                    is_primary: idx == 0,
                    mtime: m.date,
                },
            )?;
            storage.remove_leaf(parent)?;
        }
        if storage.children_of(rid)?.is_empty() {
            storage.add_leaf(rid)?;
        }

        storage.put_event(
            rid,
            &EventRecord {
                etype: EventType::Checkin,
                mtime: m.date,
                user: Some(m.user.clone()),
                comment: m.comment.clone(),
            },
        )?;

        self.build_mlinks(rid, m)?;
        for tag in &m.tags {
            self.apply_tag(rid, tag, m.date)?;
        }

        // children that arrived before this parent can now diff properly
        for (child, _) in storage.children_of(rid)? {
            self.relink_mlinks(child)?;
        }

        self.state.lock().touched.push(rid);
        Ok(())
    }

    /// Effective file list of a checkin, or None while its baseline is
    /// unavailable (unknown, phantom, or itself a delta).
    fn effective_files(&self, m: &Checkin) -> Result<Option<Vec<FileEntry>>> {
        let Some(baseline_uuid) = m.baseline else {
            return Ok(Some(m.files_with(None).cloned().collect()));
        };
        let Some(baseline_rid) = self.repo.storage().rid_for_uuid(&baseline_uuid)? else {
            return Ok(None);
        };
        if !self.repo.content_available(baseline_rid)? {
            return Ok(None);
        }
        let bytes = self.repo.get(baseline_rid)?;
        match Manifest::parse(&bytes) {
            Ok(Manifest::Checkin(base)) if base.baseline.is_none() => {
                Ok(Some(m.files_with(Some(&base)).cloned().collect()))
            }
            _ => {
                warn!(rid = baseline_rid.0, "baseline is not a baseline checkin");
                Ok(None)
            }
        }
    }

    fn build_mlinks(&self, rid: Rid, m: &Checkin) -> Result<()> {
        let private = self.repo.is_private(rid)?;
        let storage = self.repo.storage();

        let Some(child_files) = self.effective_files(m)? else {
            // baseline still missing: remember the delta and replay the
            // file-change rows when the baseline arrives
            if let Some(baseline_uuid) = m.baseline {
                let baseline_rid = self.repo.ensure_rid(baseline_uuid, private)?;
                storage.add_orphan(rid, baseline_rid)?;
                debug!(rid = rid.0, baseline = baseline_rid.0, "orphaned delta checkin");
            }
            return Ok(());
        };

        let parent_manifest: Option<Checkin> = match m.parents.first() {
            Some(parent_uuid) => match storage.rid_for_uuid(parent_uuid)? {
                Some(parent_rid) if self.repo.content_available(parent_rid)? => {
                    match Manifest::parse(&self.repo.get(parent_rid)?) {
                        Ok(Manifest::Checkin(pm)) => Some(pm),
                        _ => None,
                    }
                }
                _ => None,
            },
            None => None,
        };
        let parent_files: Vec<FileEntry> = match &parent_manifest {
            Some(pm) => self.effective_files(pm)?.unwrap_or_default(),
            None => Vec::new(),
        };

        storage.clear_mlinks(rid)?;
        let mut parent_map: BTreeMap<&str, &FileEntry> = parent_files
            .iter()
            .map(|f| (f.name.as_str(), f))
            .collect();

        for entry in &child_files {
            let Some(uuid) = entry.uuid else { continue };
            let prior = entry.prior_name.as_deref().unwrap_or(&entry.name);
            let parent_entry = parent_map.remove(prior);
            let fid = self.repo.ensure_rid(uuid, private)?.0;
            let pid = match parent_entry.and_then(|p| p.uuid) {
                Some(parent_uuid) => self.repo.ensure_rid(parent_uuid, private)?.0,
                None => 0,
            };
            let renamed = entry.prior_name.is_some();
            let perm_changed = parent_entry.map(|p| p.perm != entry.perm).unwrap_or(true);
            if fid != pid || renamed || perm_changed {
                let fnid = storage.intern_filename(&entry.name)?;
                let pfnid = if renamed {
                    storage.intern_filename(prior)?
                } else {
                    0
                };
                storage.put_mlink(
                    rid,
                    fnid,
                    &MlinkRecord {
                        fid,
                        pid,
                        pfnid,
                        perm: entry.perm,
                    },
                )?;
            }
        }
        // whatever is left in the parent list was deleted
        for (name, parent_entry) in parent_map {
            let Some(parent_uuid) = parent_entry.uuid else {
                continue;
            };
            let pid = self.repo.ensure_rid(parent_uuid, private)?.0;
            let fnid = storage.intern_filename(name)?;
            storage.put_mlink(
                rid,
                fnid,
                &MlinkRecord {
                    fid: 0,
                    pid,
                    pfnid: 0,
                    perm: parent_entry.perm,
                },
            )?;
        }
        Ok(())
    }

    fn relink_mlinks(&self, rid: Rid) -> Result<()> {
        let Ok(content) = self.repo.get(rid) else {
            return Ok(());
        };
        if let Ok(Manifest::Checkin(m)) = Manifest::parse(&content) {
            self.build_mlinks(rid, &m)?;
        }
        Ok(())
    }

    // -- clusters ----------------------------------------------------------

    fn link_cluster(&self, m: &Cluster) -> Result<()> {
        let storage = self.repo.storage();
        for member in &m.members {
            // unknown members become phantoms so the next pull round can
            // request them
            let rid = match self.repo.ensure_rid(*member, false) {
                Ok(rid) => rid,
                Err(StoreError::ShunnedArtifact(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            storage.remove_unclustered(rid)?;
        }
        Ok(())
    }

    // -- tags --------------------------------------------------------------

    fn link_control(&self, rid: Rid, m: &Control) -> Result<()> {
        for tag in &m.tags {
            self.apply_tag(rid, tag, m.date)?;
        }
        self.repo.storage().put_event(
            rid,
            &EventRecord {
                etype: EventType::Control,
                mtime: m.date,
                user: m.user.clone(),
                comment: None,
            },
        )?;
        Ok(())
    }

    fn apply_tag(&self, source: Rid, tag: &TagCard, date: f64) -> Result<()> {
        let private = self.repo.is_private(source)?;
        let storage = self.repo.storage();
        let target = match tag.target {
            TagTarget::SelfRef => source,
            TagTarget::Artifact(uuid) => self.repo.ensure_rid(uuid, private)?,
        };
        let tagid = storage.intern_tag(&tag.name)?;

        if let Some(existing) = storage.get_tagxref(tagid, target)? {
            // a strictly newer assignment dominates
            if existing.mtime > date {
                return Ok(());
            }
        }
        let tagtype = match tag.scope {
            TagScope::Cancel => TagType::Cancel,
            TagScope::Add => TagType::Add,
            TagScope::Propagate => TagType::Propagate,
        };
        storage.put_tagxref(
            tagid,
            target,
            &TagxrefRecord {
                tagtype,
                srcid: source.0,
                value: tag.value.clone(),
                mtime: date,
            },
        )?;

        if tag.name == TAG_DATE && tag.scope != TagScope::Cancel {
            if let Some(override_date) = tag.value.as_deref().and_then(parse_date) {
                if let Some(mut event) = storage.get_event(target)? {
                    event.mtime = override_date;
                    storage.put_event(target, &event)?;
                }
            }
        }

        match tag.scope {
            TagScope::Propagate => self.propagate_tag(tagid, target, date, tag.value.clone())?,
            TagScope::Cancel => self.retract_tag(tagid, target, date)?,
            TagScope::Add => {}
        }

        if tag.name == TAG_BRANCH {
            self.recheck_leaf(target)?;
        }
        Ok(())
    }

    /// Carry a propagating tag to descendants across primary edges,
    /// visiting nodes in mtime order.
    fn propagate_tag(
        &self,
        tagid: i64,
        origin: Rid,
        date: f64,
        value: Option<String>,
    ) -> Result<()> {
        let storage = self.repo.storage();
        let mut heap: BinaryHeap<Reverse<ByMtime>> = BinaryHeap::new();
        let mut visited: BTreeSet<Rid> = BTreeSet::new();
        heap.push(Reverse(ByMtime(date, origin)));

        while let Some(Reverse(ByMtime(_, node))) = heap.pop() {
            if !visited.insert(node) {
                continue;
            }
            for (child, edge) in storage.children_of(node)? {
                if !edge.is_primary {
                    continue;
                }
                if let Some(existing) = storage.get_tagxref(tagid, child)? {
                    // the newer assignment (singleton or anti-tag) wins;
                    // propagation stops through this child
                    if existing.mtime > date {
                        continue;
                    }
                }
                storage.put_tagxref(
                    tagid,
                    child,
                    &TagxrefRecord {
                        tagtype: TagType::Propagate,
                        srcid: 0,
                        value: value.clone(),
                        mtime: date,
                    },
                )?;
                heap.push(Reverse(ByMtime(edge.mtime, child)));
            }
        }
        Ok(())
    }

    /// An anti-tag removes previously propagated rows below its target.
    fn retract_tag(&self, tagid: i64, origin: Rid, date: f64) -> Result<()> {
        let storage = self.repo.storage();
        let mut stack = vec![origin];
        let mut visited: BTreeSet<Rid> = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            for (child, edge) in storage.children_of(node)? {
                if !edge.is_primary {
                    continue;
                }
                if let Some(existing) = storage.get_tagxref(tagid, child)? {
                    if existing.srcid == 0 && existing.mtime <= date {
                        storage.remove_tagxref(tagid, child)?;
                        stack.push(child);
                    }
                    // a direct assignment shields its own subtree
                }
            }
        }
        Ok(())
    }

    fn recheck_leaf(&self, rid: Rid) -> Result<()> {
        let storage = self.repo.storage();
        if storage.children_of(rid)?.is_empty() {
            storage.add_leaf(rid)?;
        } else {
            storage.remove_leaf(rid)?;
        }
        Ok(())
    }

    // -- wiki --------------------------------------------------------------

    fn link_wiki(&self, rid: Rid, m: &Wiki) -> Result<()> {
        let storage = self.repo.storage();
        let tagid = storage.intern_tag(&format!("wiki-{}", m.title))?;
        let existing = storage.get_tagxref(tagid, rid)?;
        if existing.map(|e| e.mtime <= m.date).unwrap_or(true) {
            storage.put_tagxref(
                tagid,
                rid,
                &TagxrefRecord {
                    tagtype: TagType::Add,
                    srcid: rid.0,
                    value: None,
                    mtime: m.date,
                },
            )?;
        }

        let newest = match storage.wiki_page(&m.title)? {
            Some(current) => match storage.get_event(current)? {
                Some(event) => event.mtime <= m.date,
                None => true,
            },
            None => true,
        };
        if newest {
            storage.set_wiki_page(&m.title, rid)?;
        }

        storage.put_event(
            rid,
            &EventRecord {
                etype: EventType::Wiki,
                mtime: m.date,
                user: m.user.clone(),
                comment: Some(m.title.clone()),
            },
        )?;
        Ok(())
    }

    // -- tickets -----------------------------------------------------------

    fn link_ticket(&self, rid: Rid, m: &Ticket) -> Result<()> {
        let storage = self.repo.storage();
        storage.add_ticket_change(&m.ticket_id, rid, m.date)?;
        storage.put_event(
            rid,
            &EventRecord {
                etype: EventType::Ticket,
                mtime: m.date,
                user: Some(m.user.clone()),
                comment: None,
            },
        )?;
        self.state.lock().pending_tickets.insert(m.ticket_id);
        Ok(())
    }

    /// Replay every edit of one ticket in timestamp order.
    fn rebuild_ticket(&self, ticket_id: &ArtifactId) -> Result<()> {
        let storage = self.repo.storage();
        let mut changes = storage.ticket_changes(ticket_id)?;
        changes.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut record = TicketRecord::default();
        for (mtime, rid) in changes {
            let Ok(content) = self.repo.get(rid) else {
                continue;
            };
            let Ok(Manifest::Ticket(t)) = Manifest::parse(&content) else {
                continue;
            };
            for field in &t.fields {
                if field.append {
                    record
                        .fields
                        .entry(field.name.clone())
                        .or_default()
                        .push_str(&field.value);
                } else {
                    record.fields.insert(field.name.clone(), field.value.clone());
                }
            }
            record.mtime = mtime;
        }
        storage.put_ticket(ticket_id, &record)?;
        Ok(())
    }

    // -- attachments -------------------------------------------------------

    fn link_attachment(&self, rid: Rid, m: &Attachment) -> Result<()> {
        let storage = self.repo.storage();
        let is_latest = match storage.latest_attachment(&m.target, &m.filename)? {
            Some(previous) if previous != rid => match storage.get_attachment(previous)? {
                Some(mut prev_record) => {
                    if prev_record.mtime <= m.date {
                        prev_record.is_latest = false;
                        storage.put_attachment(previous, &prev_record)?;
                        true
                    } else {
                        false
                    }
                }
                None => true,
            },
            _ => true,
        };
        storage.put_attachment(
            rid,
            &AttachRecord {
                target: m.target.clone(),
                filename: m.filename.clone(),
                src: m.src,
                mtime: m.date,
                is_latest,
            },
        )?;
        if is_latest {
            storage.set_latest_attachment(&m.target, &m.filename, rid)?;
        }

        // ticket targets look like artifact identifiers; everything else
        // is a wiki page name
        let etype = if ArtifactId::from_hex(&m.target).is_ok() {
            EventType::Ticket
        } else {
            EventType::Wiki
        };
        storage.put_event(
            rid,
            &EventRecord {
                etype,
                mtime: m.date,
                user: m.user.clone(),
                comment: m.comment.clone(),
            },
        )?;
        Ok(())
    }

    // -- events ------------------------------------------------------------

    fn link_event(&self, rid: Rid, m: &Event) -> Result<()> {
        let storage = self.repo.storage();
        let replace = match storage.technote(&m.note_id)? {
            Some(current) if current != rid => match self.artifact_date(current)? {
                Some(current_date) => current_date <= m.date,
                None => true,
            },
            _ => true,
        };
        if replace {
            if let Some(current) = storage.technote(&m.note_id)? {
                if current != rid {
                    storage.remove_event(current)?;
                }
            }
            storage.set_technote(&m.note_id, rid)?;
            storage.put_event(
                rid,
                &EventRecord {
                    etype: EventType::Note,
                    mtime: m.note_date,
                    user: m.user.clone(),
                    comment: m.comment.clone(),
                },
            )?;
        }
        for tag in &m.tags {
            self.apply_tag(rid, tag, m.date)?;
        }
        Ok(())
    }

    fn artifact_date(&self, rid: Rid) -> Result<Option<f64>> {
        let Ok(content) = self.repo.get(rid) else {
            return Ok(None);
        };
        Ok(Manifest::parse(&content).ok().and_then(|m| m.date()))
    }

    // -- end-of-batch fudge ------------------------------------------------

    /// Nudge parents' displayed times below their primary children when a
    /// pair is out of order by less than [`FUDGE_WINDOW`]. Only the event
    /// row moves; artifacts are immutable.
    fn fudge_timestamps(&self, touched: &[Rid]) -> Result<()> {
        let storage = self.repo.storage();
        let mut pairs: BTreeSet<(Rid, Rid)> = BTreeSet::new();
        for &rid in touched {
            for (parent, edge) in storage.parents_of(rid)? {
                if edge.is_primary {
                    pairs.insert((parent, rid));
                }
            }
            for (child, edge) in storage.children_of(rid)? {
                if edge.is_primary {
                    pairs.insert((rid, child));
                }
            }
        }
        for (parent, child) in pairs {
            let (Some(mut parent_event), Some(child_event)) =
                (storage.get_event(parent)?, storage.get_event(child)?)
            else {
                continue;
            };
            if parent_event.mtime >= child_event.mtime
                && parent_event.mtime - child_event.mtime < FUDGE_WINDOW
            {
                let mut rounds = 0;
                while parent_event.mtime >= child_event.mtime && rounds < FUDGE_ROUNDS {
                    parent_event.mtime -= FUDGE_STEP;
                    rounds += 1;
                }
                debug!(parent = parent.0, child = child.0, rounds, "fudged display time");
                storage.put_event(parent, &parent_event)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reliquary_core::hash::artifact_id;
    use reliquary_core::manifest::TicketField;
    use reliquary_core::types::FilePerm;
    use tempfile::tempdir;

    fn setup() -> (Crosslinker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        (Crosslinker::new(repo), dir)
    }

    fn store_blob(x: &Crosslinker, content: &[u8]) -> ArtifactId {
        x.repo().put(content, None, None, false).unwrap();
        artifact_id(content)
    }

    fn store_manifest(x: &Crosslinker, m: &Manifest) -> (Rid, ArtifactId) {
        let bytes = m.to_bytes();
        let rid = x.repo().put(&bytes, None, None, false).unwrap();
        x.crosslink(rid).unwrap();
        (rid, artifact_id(&bytes))
    }

    fn checkin(
        date: f64,
        files: Vec<FileEntry>,
        parents: Vec<ArtifactId>,
    ) -> Manifest {
        Manifest::Checkin(Checkin {
            baseline: None,
            comment: Some("work".into()),
            date,
            files,
            parents,
            cherrypicks: vec![],
            tree_checksum: None,
            tags: vec![],
            user: "alice".into(),
        })
    }

    fn file(name: &str, uuid: ArtifactId) -> FileEntry {
        FileEntry::new(name, uuid)
    }

    /// Rid-independent view of the derived tables, comparable across an
    /// incremental pass and a rebuild.
    fn snapshot(x: &Crosslinker) -> Vec<String> {
        let repo = x.repo();
        let s = repo.storage();
        let name_of = |rid: Rid| -> String {
            repo.uuid_of(rid)
                .unwrap()
                .map(|u| u.to_hex())
                .unwrap_or_else(|| format!("rid{}", rid.0))
        };
        let blob_of = |id: i64| -> String {
            if id == 0 {
                "-".into()
            } else {
                name_of(Rid(id))
            }
        };
        let mut lines = Vec::new();
        for item in s.iter_plinks() {
            let (child, parent, rec) = item.unwrap();
            lines.push(format!(
                "plink {} -> {} primary={} mtime={}",
                name_of(parent),
                name_of(child),
                rec.is_primary,
                rec.mtime
            ));
        }
        for item in s.iter_mlinks() {
            let (mid, fnid, rec) = item.unwrap();
            let fname = s.filename_of(fnid).unwrap().unwrap_or_default();
            let pfname = if rec.pfnid == 0 {
                "-".into()
            } else {
                s.filename_of(rec.pfnid).unwrap().unwrap_or_default()
            };
            lines.push(format!(
                "mlink {} {} fid={} pid={} prior={} perm={:?}",
                name_of(mid),
                fname,
                blob_of(rec.fid),
                blob_of(rec.pid),
                pfname,
                rec.perm
            ));
        }
        for item in s.iter_events() {
            let (rid, ev) = item.unwrap();
            lines.push(format!(
                "event {} {:?} mtime={} user={:?} comment={:?}",
                name_of(rid),
                ev.etype,
                ev.mtime,
                ev.user,
                ev.comment
            ));
        }
        for item in s.iter_tagxref() {
            let (tagid, rid, rec) = item.unwrap();
            let tag = s.tag_name(tagid).unwrap().unwrap_or_default();
            lines.push(format!(
                "tagxref {} {} {:?} propagated={} value={:?} mtime={}",
                tag,
                name_of(rid),
                rec.tagtype,
                rec.srcid == 0,
                rec.value,
                rec.mtime
            ));
        }
        for rid in s.iter_leaves() {
            lines.push(format!("leaf {}", name_of(rid.unwrap())));
        }
        lines.sort();
        lines
    }

    #[test]
    fn test_checkin_links() {
        let (x, _dir) = setup();
        let s = x.repo().storage();

        let blob_a = store_blob(&x, b"contents of a, version one");
        let blob_b = store_blob(&x, b"contents of b");
        let blob_a2 = store_blob(&x, b"contents of a, version two");

        let (c1, u1) = store_manifest(
            &x,
            &checkin(
                1000.0,
                vec![file("a.txt", blob_a), file("b.txt", blob_b)],
                vec![],
            ),
        );
        let (c2, _) = store_manifest(
            &x,
            &checkin(2000.0, vec![file("a.txt", blob_a2)], vec![u1]),
        );

        // plink edge with primary flag
        let parents = s.parents_of(c2).unwrap();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].0, c1);
        assert!(parents[0].1.is_primary);

        // c1 gained two add rows, c2 one change and one delete
        let rid_a = s.rid_for_uuid(&blob_a).unwrap().unwrap();
        let rid_a2 = s.rid_for_uuid(&blob_a2).unwrap().unwrap();
        let rid_b = s.rid_for_uuid(&blob_b).unwrap().unwrap();
        let m1 = s.mlinks_of(c1).unwrap();
        assert_eq!(m1.len(), 2);
        assert!(m1.iter().all(|(_, r)| r.pid == 0));

        let m2 = s.mlinks_of(c2).unwrap();
        assert_eq!(m2.len(), 2);
        let change = m2
            .iter()
            .find(|(_, r)| r.fid == rid_a2.0)
            .expect("change row");
        assert_eq!(change.1.pid, rid_a.0);
        let delete = m2.iter().find(|(_, r)| r.fid == 0).expect("delete row");
        assert_eq!(delete.1.pid, rid_b.0);

        // leaves: only the tip
        assert!(!s.is_leaf(c1).unwrap());
        assert!(s.is_leaf(c2).unwrap());

        // timeline rows
        assert_eq!(
            s.get_event(c2).unwrap().unwrap().etype,
            EventType::Checkin
        );
    }

    #[test]
    fn test_rename_produces_prior_name_row() {
        let (x, _dir) = setup();
        let s = x.repo().storage();
        let blob = store_blob(&x, b"renamed file content");

        let (_, u1) = store_manifest(&x, &checkin(1000.0, vec![file("old.txt", blob)], vec![]));
        let renamed = FileEntry {
            name: "new.txt".into(),
            uuid: Some(blob),
            perm: FilePerm::Regular,
            prior_name: Some("old.txt".into()),
        };
        let (c2, _) = store_manifest(&x, &checkin(2000.0, vec![renamed], vec![u1]));

        let rows = s.mlinks_of(c2).unwrap();
        assert_eq!(rows.len(), 1);
        let (fnid, rec) = &rows[0];
        assert_eq!(s.filename_of(*fnid).unwrap().unwrap(), "new.txt");
        assert_eq!(s.filename_of(rec.pfnid).unwrap().unwrap(), "old.txt");
    }

    #[test]
    fn test_crosslink_is_idempotent() {
        let (x, _dir) = setup();
        let blob_a = store_blob(&x, b"idempotence file a");
        let (c1, u1) = store_manifest(&x, &checkin(1000.0, vec![file("a.txt", blob_a)], vec![]));
        let (c2, _) = store_manifest(&x, &checkin(2000.0, vec![], vec![u1]));

        let before = snapshot(&x);
        x.crosslink(c1).unwrap();
        x.crosslink(c2).unwrap();
        assert_eq!(snapshot(&x), before);
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let (x, _dir) = setup();
        let blob_a = store_blob(&x, b"rebuild file a");
        let blob_b = store_blob(&x, b"rebuild file b");
        let (_, u1) = store_manifest(
            &x,
            &checkin(1000.0, vec![file("a.txt", blob_a)], vec![]),
        );
        let (_, u2) = store_manifest(
            &x,
            &checkin(
                2000.0,
                vec![file("a.txt", blob_a), file("b.txt", blob_b)],
                vec![u1],
            ),
        );
        store_manifest(
            &x,
            &Manifest::Control(Control {
                date: 3000.0,
                tags: vec![TagCard {
                    name: "branch".into(),
                    scope: TagScope::Propagate,
                    target: TagTarget::Artifact(u2),
                    value: Some("trunk".into()),
                }],
                user: Some("alice".into()),
            }),
        );

        let incremental = snapshot(&x);
        x.rebuild().unwrap();
        assert_eq!(snapshot(&x), incremental);
    }

    #[test]
    fn test_tag_propagation_with_anti_tag() {
        let (x, _dir) = setup();
        let s = x.repo().storage();
        let (c1, u1) = store_manifest(&x, &checkin(1000.0, vec![], vec![]));
        let (c2, u2) = store_manifest(&x, &checkin(2000.0, vec![], vec![u1]));
        let (c3, _) = store_manifest(&x, &checkin(3000.0, vec![], vec![u2]));

        // propagating tag at the root
        store_manifest(
            &x,
            &Manifest::Control(Control {
                date: 4000.0,
                tags: vec![TagCard {
                    name: "release".into(),
                    scope: TagScope::Propagate,
                    target: TagTarget::Artifact(u1),
                    value: None,
                }],
                user: Some("alice".into()),
            }),
        );
        let tagid = s.tag_id("release").unwrap().unwrap();
        for rid in [c1, c2, c3] {
            let row = s.get_tagxref(tagid, rid).unwrap().expect("tag present");
            assert_ne!(row.tagtype, TagType::Cancel);
        }
        // the origin row is direct, rows below it arrived by propagation
        assert_ne!(s.get_tagxref(tagid, c1).unwrap().unwrap().srcid, 0);
        assert_eq!(s.get_tagxref(tagid, c2).unwrap().unwrap().srcid, 0);
        assert_eq!(s.get_tagxref(tagid, c3).unwrap().unwrap().srcid, 0);

        // anti-tag at the middle: cancels there and strips descendants
        store_manifest(
            &x,
            &Manifest::Control(Control {
                date: 5000.0,
                tags: vec![TagCard {
                    name: "release".into(),
                    scope: TagScope::Cancel,
                    target: TagTarget::Artifact(u2),
                    value: None,
                }],
                user: Some("alice".into()),
            }),
        );
        assert_ne!(
            s.get_tagxref(tagid, c1).unwrap().unwrap().tagtype,
            TagType::Cancel
        );
        assert_eq!(
            s.get_tagxref(tagid, c2).unwrap().unwrap().tagtype,
            TagType::Cancel
        );
        assert!(s.get_tagxref(tagid, c3).unwrap().is_none());
    }

    #[test]
    fn test_orphaned_delta_checkin_replays() {
        let (x, _dir) = setup();
        let s = x.repo().storage();
        let blob_a = store_blob(&x, b"baseline file a");
        let blob_b = store_blob(&x, b"delta adds file b");

        let baseline = checkin(1000.0, vec![file("a.txt", blob_a)], vec![]);
        let baseline_bytes = baseline.to_bytes();
        let baseline_uuid = artifact_id(&baseline_bytes);

        // a delta checkin over a baseline the repository does not have
        let delta = Manifest::Checkin(Checkin {
            baseline: Some(baseline_uuid),
            comment: Some("delta".into()),
            date: 2000.0,
            files: vec![file("b.txt", blob_b)],
            parents: vec![baseline_uuid],
            cherrypicks: vec![],
            tree_checksum: None,
            tags: vec![],
            user: "alice".into(),
        });
        let (delta_rid, _) = store_manifest(&x, &delta);

        // baseline is a phantom; no file-change rows yet
        assert!(s.mlinks_of(delta_rid).unwrap().is_empty());
        let baseline_rid = s.rid_for_uuid(&baseline_uuid).unwrap().unwrap();
        assert!(!x.repo().content_available(baseline_rid).unwrap());

        // the baseline arrives and the orphan replays
        let got = x
            .repo()
            .put(&baseline_bytes, Some(baseline_uuid), None, false)
            .unwrap();
        assert_eq!(got, baseline_rid);
        x.crosslink(baseline_rid).unwrap();

        let rows = s.mlinks_of(delta_rid).unwrap();
        // effective tree is {a.txt, b.txt}; only b.txt changed vs parent
        assert_eq!(rows.len(), 1);
        let rid_b = s.rid_for_uuid(&blob_b).unwrap().unwrap();
        assert_eq!(rows[0].1.fid, rid_b.0);
        assert_eq!(rows[0].1.pid, 0);
    }

    /// Crosslink a parent/child pair in one batch and return their
    /// fudged event rows along with the parent's artifact bytes.
    fn fudge_pair(
        x: &Crosslinker,
        parent_date: f64,
        child_date: f64,
    ) -> (EventRecord, EventRecord, Rid, Vec<u8>) {
        let parent = checkin(parent_date, vec![], vec![]);
        let parent_bytes = parent.to_bytes();
        let parent_uuid = artifact_id(&parent_bytes);
        let child = checkin(child_date, vec![], vec![parent_uuid]);

        x.crosslink_begin();
        let parent_rid = x.repo().put(&parent_bytes, None, None, false).unwrap();
        x.crosslink(parent_rid).unwrap();
        let child_bytes = child.to_bytes();
        let child_rid = x.repo().put(&child_bytes, None, None, false).unwrap();
        x.crosslink(child_rid).unwrap();
        x.crosslink_end().unwrap();

        let s = x.repo().storage();
        (
            s.get_event(parent_rid).unwrap().unwrap(),
            s.get_event(child_rid).unwrap().unwrap(),
            parent_rid,
            parent_bytes,
        )
    }

    #[test]
    fn test_timestamp_fudge_equal_times() {
        let (x, _dir) = setup();

        // same wall-clock instant on both: the pair is out of order once
        // the child must sort strictly after its parent
        let (parent_event, child_event, parent_rid, parent_bytes) =
            fudge_pair(&x, 1_000_000.0, 1_000_000.0);
        assert!(parent_event.mtime < child_event.mtime);
        // one 25 ms nudge resolves the tie
        assert!(1_000_000.0 - parent_event.mtime <= FUDGE_STEP + 1e-9);
        // the artifact itself is untouched
        assert_eq!(x.repo().get(parent_rid).unwrap(), parent_bytes);
    }

    #[test]
    fn test_timestamp_fudge_realistic_gap() {
        let (x, _dir) = setup();

        // the parent's clock ran 300 ms ahead of the child's
        let (parent_event, child_event, _, _) = fudge_pair(&x, 1_000_000.3, 1_000_000.0);
        assert!(parent_event.mtime < child_event.mtime);
        // 13 rounds of 25 ms, well inside the 30-round bound; the nudge
        // never overshoots by more than two steps
        assert!(child_event.mtime - parent_event.mtime <= 2.0 * FUDGE_STEP);
        assert!(1_000_000.3 - parent_event.mtime <= FUDGE_ROUNDS as f64 * FUDGE_STEP);
    }

    #[test]
    fn test_timestamp_fudge_leaves_distant_pairs_alone() {
        let (x, _dir) = setup();

        // out of order by more than the window: no adjustment at all
        let (parent_event, child_event, _, _) = fudge_pair(&x, 1_000_003.0, 1_000_000.0);
        assert_eq!(parent_event.mtime, 1_000_003.0);
        assert_eq!(child_event.mtime, 1_000_000.0);
    }

    #[test]
    fn test_ticket_rebuild_accumulates() {
        let (x, _dir) = setup();
        let tkt = artifact_id(b"ticket-id");

        store_manifest(
            &x,
            &Manifest::Ticket(Ticket {
                date: 1000.0,
                ticket_id: tkt,
                fields: vec![
                    TicketField {
                        append: false,
                        name: "status".into(),
                        value: "open".into(),
                    },
                    TicketField {
                        append: false,
                        name: "text".into(),
                        value: "it breaks".into(),
                    },
                ],
                user: "alice".into(),
            }),
        );
        store_manifest(
            &x,
            &Manifest::Ticket(Ticket {
                date: 2000.0,
                ticket_id: tkt,
                fields: vec![
                    TicketField {
                        append: false,
                        name: "status".into(),
                        value: "closed".into(),
                    },
                    TicketField {
                        append: true,
                        name: "text".into(),
                        value: " -- fixed".into(),
                    },
                ],
                user: "bob".into(),
            }),
        );

        let record = x.repo().storage().get_ticket(&tkt).unwrap().unwrap();
        assert_eq!(record.fields["status"], "closed");
        assert_eq!(record.fields["text"], "it breaks -- fixed");
        assert_eq!(record.mtime, 2000.0);
    }

    #[test]
    fn test_event_note_newer_replaces_older() {
        let (x, _dir) = setup();
        let s = x.repo().storage();
        let note_id = artifact_id(b"note-id");

        let make = |date: f64, body: &str| {
            Manifest::Event(Event {
                date,
                note_date: date + 10.0,
                note_id,
                parents: vec![],
                tags: vec![],
                user: Some("alice".into()),
                comment: None,
                body: body.into(),
            })
        };
        let (old_rid, _) = store_manifest(&x, &make(1000.0, "first draft"));
        let (new_rid, _) = store_manifest(&x, &make(2000.0, "second draft"));

        assert_eq!(s.technote(&note_id).unwrap(), Some(new_rid));
        assert!(s.get_event(old_rid).unwrap().is_none());
        assert!(s.get_event(new_rid).unwrap().is_some());

        // a stale revision arriving later does not take over
        let (stale_rid, _) = store_manifest(&x, &make(1500.0, "stale"));
        assert_eq!(s.technote(&note_id).unwrap(), Some(new_rid));
        assert!(s.get_event(stale_rid).unwrap().is_none());
    }

    #[test]
    fn test_cluster_members_leave_unclustered() {
        let (x, _dir) = setup();
        let s = x.repo().storage();
        let known = store_blob(&x, b"already stored member");
        let unknown = artifact_id(b"content nobody sent yet");

        let (_, _) = store_manifest(
            &x,
            &Manifest::Cluster(Cluster {
                members: vec![known, unknown],
            }),
        );

        let known_rid = s.rid_for_uuid(&known).unwrap().unwrap();
        let unclustered = x.repo().iter_unclustered().unwrap();
        assert!(!unclustered.contains(&known_rid));

        // the unknown member is now a phantom awaiting a gimme
        let phantom_rid = s.rid_for_uuid(&unknown).unwrap().unwrap();
        assert!(x.repo().iter_phantoms().unwrap().contains(&phantom_rid));
    }

    #[test]
    fn test_attachment_latest_flag() {
        let (x, _dir) = setup();
        let s = x.repo().storage();
        let target = artifact_id(b"some ticket").to_hex();
        let src1 = store_blob(&x, b"attachment v1");
        let src2 = store_blob(&x, b"attachment v2");

        let make = |date: f64, src: ArtifactId| {
            Manifest::Attachment(reliquary_core::manifest::Attachment {
                date,
                filename: "log.txt".into(),
                target: target.clone(),
                src: Some(src),
                comment: None,
                user: Some("alice".into()),
            })
        };
        let (a1, _) = store_manifest(&x, &make(1000.0, src1));
        let (a2, _) = store_manifest(&x, &make(2000.0, src2));

        assert_eq!(s.latest_attachment(&target, "log.txt").unwrap(), Some(a2));
        assert!(!s.get_attachment(a1).unwrap().unwrap().is_latest);
        assert!(s.get_attachment(a2).unwrap().unwrap().is_latest);
        // ticket-shaped target puts the row on the ticket timeline
        assert_eq!(s.get_event(a2).unwrap().unwrap().etype, EventType::Ticket);
    }

    #[test]
    fn test_opaque_content_is_skipped() {
        let (x, _dir) = setup();
        let rid = x.repo().put(b"not a manifest at all\n", None, None, false).unwrap();
        x.crosslink(rid).unwrap();
        assert!(x.repo().storage().get_event(rid).unwrap().is_none());
    }
}
