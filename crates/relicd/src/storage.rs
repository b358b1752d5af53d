//! Persistent storage using sled
//!
//! One tree per table. Rids are 8-byte big-endian keys, so tree order is
//! rid order. Composite keys concatenate fixed-width big-endian parts.
//! The artifact tables (`blob`, `content`, `delta`, sets) are the durable
//! truth; every derived tree can be dropped and rebuilt from them.

use reliquary_core::types::{ArtifactId, FilePerm, Rid};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

type Result<T> = std::result::Result<T, StorageError>;

/// Artifact metadata. `size == -1` marks a phantom: the identifier is
/// known, the content has not arrived.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BlobRecord {
    pub uuid: ArtifactId,
    pub size: i64,
    pub rcvid: i64,
}

impl BlobRecord {
    pub fn is_phantom(&self) -> bool {
        self.size < 0
    }
}

/// A banned identifier with the operator's note.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ShunRecord {
    pub mtime: f64,
    pub scom: String,
}

/// Receipt for one batch of arriving artifacts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RcvRecord {
    pub uid: String,
    pub mtime: f64,
    pub ipaddr: String,
    pub nonce: String,
}

/// Parent/child edge between checkins.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlinkRecord {
    pub is_primary: bool,
    pub mtime: f64,
}

/// One file change in a checkin. `fid == 0` deletes, `pid == 0` adds,
/// `pfnid != 0` records the prior name of a rename.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MlinkRecord {
    pub fid: i64,
    pub pid: i64,
    pub pfnid: i64,
    pub perm: FilePerm,
}

/// Kind of a tag assignment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TagType {
    Cancel,
    Add,
    Propagate,
}

/// A tag bound to a target. `srcid == 0` means the row arrived by
/// propagation rather than directly from an artifact.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TagxrefRecord {
    pub tagtype: TagType,
    pub srcid: i64,
    pub value: Option<String>,
    pub mtime: f64,
}

/// Timeline row type.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Checkin,
    Wiki,
    Ticket,
    Note,
    Control,
}

/// One timeline row. `mtime` is the display time and may be nudged by the
/// timestamp-fudge pass; the artifact itself is never touched.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub etype: EventType,
    pub mtime: f64,
    pub user: Option<String>,
    pub comment: Option<String>,
}

/// One attachment row; at most one row per (target, filename) is latest.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AttachRecord {
    pub target: String,
    pub filename: String,
    pub src: Option<ArtifactId>,
    pub mtime: f64,
    pub is_latest: bool,
}

/// Accumulated ticket state, rebuilt by replaying J-card edits.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TicketRecord {
    pub fields: BTreeMap<String, String>,
    pub mtime: f64,
}

/// One account in the user table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub login: String,
    /// Plaintext or 40-hex SHA-1 stored form
    pub pw: String,
    /// Capability characters (o=read, i=write, g=clone, x=private)
    pub caps: String,
}

fn pair_key(a: Rid, b: Rid) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&a.to_key());
    key[8..].copy_from_slice(&b.to_key());
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(value)?)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Storage backend for relicd
pub struct Storage {
    db: Db,
    // artifact tables
    blob: sled::Tree,
    content: sled::Tree,
    uuid_index: sled::Tree,
    delta: sled::Tree,
    phantom: sled::Tree,
    private: sled::Tree,
    shun: sled::Tree,
    unclustered: sled::Tree,
    unsent: sled::Tree,
    rcvfrom: sled::Tree,
    users: sled::Tree,
    meta: sled::Tree,
    // derived tables
    orphan: sled::Tree,
    plink: sled::Tree,
    plink_children: sled::Tree,
    mlink: sled::Tree,
    filename: sled::Tree,
    filename_rev: sled::Tree,
    tag: sled::Tree,
    tag_rev: sled::Tree,
    tagxref: sled::Tree,
    event: sled::Tree,
    leaf: sled::Tree,
    wiki: sled::Tree,
    technote: sled::Tree,
    ticket: sled::Tree,
    ticketchng: sled::Tree,
    attachment: sled::Tree,
    attach_latest: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            blob: db.open_tree("blob")?,
            content: db.open_tree("content")?,
            uuid_index: db.open_tree("uuid_index")?,
            delta: db.open_tree("delta")?,
            phantom: db.open_tree("phantom")?,
            private: db.open_tree("private")?,
            shun: db.open_tree("shun")?,
            unclustered: db.open_tree("unclustered")?,
            unsent: db.open_tree("unsent")?,
            rcvfrom: db.open_tree("rcvfrom")?,
            users: db.open_tree("users")?,
            meta: db.open_tree("meta")?,
            orphan: db.open_tree("orphan")?,
            plink: db.open_tree("plink")?,
            plink_children: db.open_tree("plink_children")?,
            mlink: db.open_tree("mlink")?,
            filename: db.open_tree("filename")?,
            filename_rev: db.open_tree("filename_rev")?,
            tag: db.open_tree("tag")?,
            tag_rev: db.open_tree("tag_rev")?,
            tagxref: db.open_tree("tagxref")?,
            event: db.open_tree("event")?,
            leaf: db.open_tree("leaf")?,
            wiki: db.open_tree("wiki")?,
            technote: db.open_tree("technote")?,
            ticket: db.open_tree("ticket")?,
            ticketchng: db.open_tree("ticketchng")?,
            attachment: db.open_tree("attachment")?,
            attach_latest: db.open_tree("attach_latest")?,
            db,
        })
    }

    /// Allocate a fresh rid (monotonic, never reused).
    pub fn alloc_rid(&self) -> Result<Rid> {
        Ok(Rid(self.db.generate_id()? as i64 + 1))
    }

    // -- blob / content ----------------------------------------------------

    pub fn put_blob(&self, rid: Rid, record: &BlobRecord) -> Result<()> {
        self.blob.insert(rid.to_key(), encode(record)?)?;
        self.uuid_index.insert(record.uuid.as_bytes(), &rid.to_key())?;
        if record.is_phantom() {
            self.phantom.insert(rid.to_key(), &[])?;
        } else {
            self.phantom.remove(rid.to_key())?;
        }
        Ok(())
    }

    pub fn get_blob(&self, rid: Rid) -> Result<Option<BlobRecord>> {
        match self.blob.get(rid.to_key())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_blob(&self, rid: Rid, uuid: &ArtifactId) -> Result<()> {
        self.blob.remove(rid.to_key())?;
        self.uuid_index.remove(uuid.as_bytes())?;
        self.content.remove(rid.to_key())?;
        self.phantom.remove(rid.to_key())?;
        self.delta.remove(rid.to_key())?;
        self.private.remove(rid.to_key())?;
        self.unclustered.remove(rid.to_key())?;
        self.unsent.remove(rid.to_key())?;
        Ok(())
    }

    pub fn rid_for_uuid(&self, uuid: &ArtifactId) -> Result<Option<Rid>> {
        Ok(self
            .uuid_index
            .get(uuid.as_bytes())?
            .map(|k| Rid::from_key(&k)))
    }

    pub fn put_content(&self, rid: Rid, bytes: &[u8]) -> Result<()> {
        self.content.insert(rid.to_key(), bytes)?;
        Ok(())
    }

    pub fn get_content(&self, rid: Rid) -> Result<Option<Vec<u8>>> {
        Ok(self.content.get(rid.to_key())?.map(|v| v.to_vec()))
    }

    pub fn blob_count(&self) -> usize {
        self.blob.len()
    }

    /// All blobs in rid order.
    pub fn iter_blobs(&self) -> impl Iterator<Item = Result<(Rid, BlobRecord)>> + '_ {
        self.blob.iter().map(|result| {
            let (key, bytes) = result?;
            Ok((Rid::from_key(&key), decode(&bytes)?))
        })
    }

    // -- delta edges -------------------------------------------------------

    pub fn set_delta(&self, rid: Rid, srcid: Rid) -> Result<()> {
        self.delta.insert(rid.to_key(), &srcid.to_key())?;
        Ok(())
    }

    pub fn delta_src(&self, rid: Rid) -> Result<Option<Rid>> {
        Ok(self.delta.get(rid.to_key())?.map(|k| Rid::from_key(&k)))
    }

    pub fn clear_delta(&self, rid: Rid) -> Result<()> {
        self.delta.remove(rid.to_key())?;
        Ok(())
    }

    /// Every rid stored as a delta against `srcid`. Full scan; used only
    /// by undelta and private-content removal.
    pub fn deltas_from(&self, srcid: Rid) -> Result<Vec<Rid>> {
        let want = srcid.to_key();
        let mut out = Vec::new();
        for item in self.delta.iter() {
            let (key, value) = item?;
            if value.as_ref() == want {
                out.push(Rid::from_key(&key));
            }
        }
        Ok(out)
    }

    // -- rid sets ----------------------------------------------------------

    fn set_add(tree: &sled::Tree, rid: Rid) -> Result<()> {
        tree.insert(rid.to_key(), &[])?;
        Ok(())
    }

    fn set_remove(tree: &sled::Tree, rid: Rid) -> Result<()> {
        tree.remove(rid.to_key())?;
        Ok(())
    }

    fn set_contains(tree: &sled::Tree, rid: Rid) -> Result<bool> {
        Ok(tree.contains_key(rid.to_key())?)
    }

    fn set_iter(tree: &sled::Tree) -> impl Iterator<Item = Result<Rid>> + '_ {
        tree.iter().map(|result| {
            let (key, _) = result?;
            Ok(Rid::from_key(&key))
        })
    }

    pub fn add_private(&self, rid: Rid) -> Result<()> {
        Self::set_add(&self.private, rid)
    }
    pub fn remove_private(&self, rid: Rid) -> Result<()> {
        Self::set_remove(&self.private, rid)
    }
    pub fn is_private(&self, rid: Rid) -> Result<bool> {
        Self::set_contains(&self.private, rid)
    }
    pub fn iter_private(&self) -> impl Iterator<Item = Result<Rid>> + '_ {
        Self::set_iter(&self.private)
    }

    pub fn add_unclustered(&self, rid: Rid) -> Result<()> {
        Self::set_add(&self.unclustered, rid)
    }
    pub fn remove_unclustered(&self, rid: Rid) -> Result<()> {
        Self::set_remove(&self.unclustered, rid)
    }
    pub fn iter_unclustered(&self) -> impl Iterator<Item = Result<Rid>> + '_ {
        Self::set_iter(&self.unclustered)
    }

    pub fn add_unsent(&self, rid: Rid) -> Result<()> {
        Self::set_add(&self.unsent, rid)
    }
    pub fn remove_unsent(&self, rid: Rid) -> Result<()> {
        Self::set_remove(&self.unsent, rid)
    }
    pub fn iter_unsent(&self) -> impl Iterator<Item = Result<Rid>> + '_ {
        Self::set_iter(&self.unsent)
    }

    pub fn iter_phantoms(&self) -> impl Iterator<Item = Result<Rid>> + '_ {
        Self::set_iter(&self.phantom)
    }

    pub fn add_leaf(&self, rid: Rid) -> Result<()> {
        Self::set_add(&self.leaf, rid)
    }
    pub fn remove_leaf(&self, rid: Rid) -> Result<()> {
        Self::set_remove(&self.leaf, rid)
    }
    pub fn is_leaf(&self, rid: Rid) -> Result<bool> {
        Self::set_contains(&self.leaf, rid)
    }
    pub fn iter_leaves(&self) -> impl Iterator<Item = Result<Rid>> + '_ {
        Self::set_iter(&self.leaf)
    }

    // -- shun --------------------------------------------------------------

    pub fn add_shun(&self, uuid: &ArtifactId, record: &ShunRecord) -> Result<()> {
        self.shun.insert(uuid.as_bytes(), encode(record)?)?;
        Ok(())
    }

    pub fn remove_shun(&self, uuid: &ArtifactId) -> Result<()> {
        self.shun.remove(uuid.as_bytes())?;
        Ok(())
    }

    pub fn is_shunned(&self, uuid: &ArtifactId) -> Result<bool> {
        Ok(self.shun.contains_key(uuid.as_bytes())?)
    }

    pub fn iter_shun(&self) -> impl Iterator<Item = Result<(ArtifactId, ShunRecord)>> + '_ {
        self.shun.iter().map(|result| {
            let (key, bytes) = result?;
            let mut id = [0u8; 20];
            id.copy_from_slice(&key);
            Ok((ArtifactId(id), decode(&bytes)?))
        })
    }

    // -- orphans -----------------------------------------------------------

    pub fn add_orphan(&self, rid: Rid, baseline: Rid) -> Result<()> {
        self.orphan.insert(rid.to_key(), &baseline.to_key())?;
        Ok(())
    }

    pub fn remove_orphan(&self, rid: Rid) -> Result<()> {
        self.orphan.remove(rid.to_key())?;
        Ok(())
    }

    /// Orphans waiting on `baseline`, removed as they are returned.
    pub fn take_orphans_of(&self, baseline: Rid) -> Result<Vec<Rid>> {
        let want = baseline.to_key();
        let mut out = Vec::new();
        for item in self.orphan.iter() {
            let (key, value) = item?;
            if value.as_ref() == want {
                out.push(Rid::from_key(&key));
            }
        }
        for rid in &out {
            self.orphan.remove(rid.to_key())?;
        }
        Ok(out)
    }

    // -- receipts ----------------------------------------------------------

    pub fn add_rcv(&self, record: &RcvRecord) -> Result<i64> {
        let rcvid = self.db.generate_id()? as i64 + 1;
        self.rcvfrom
            .insert((rcvid as u64).to_be_bytes(), encode(record)?)?;
        Ok(rcvid)
    }

    pub fn get_rcv(&self, rcvid: i64) -> Result<Option<RcvRecord>> {
        match self.rcvfrom.get((rcvid as u64).to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // -- users -------------------------------------------------------------

    pub fn put_user(&self, user: &UserRecord) -> Result<()> {
        self.users.insert(user.login.as_bytes(), encode(user)?)?;
        Ok(())
    }

    pub fn get_user(&self, login: &str) -> Result<Option<UserRecord>> {
        match self.users.get(login.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // -- meta / config -----------------------------------------------------

    pub fn put_meta(&self, key: &str, value: &str) -> Result<()> {
        self.meta.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .meta
            .get(key.as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    // -- plink -------------------------------------------------------------

    pub fn put_plink(&self, parent: Rid, child: Rid, record: &PlinkRecord) -> Result<()> {
        let bytes = encode(record)?;
        self.plink.insert(pair_key(child, parent), bytes.clone())?;
        self.plink_children.insert(pair_key(parent, child), bytes)?;
        Ok(())
    }

    pub fn parents_of(&self, child: Rid) -> Result<Vec<(Rid, PlinkRecord)>> {
        let mut out = Vec::new();
        for item in self.plink.scan_prefix(child.to_key()) {
            let (key, bytes) = item?;
            out.push((Rid::from_key(&key[8..]), decode(&bytes)?));
        }
        Ok(out)
    }

    pub fn children_of(&self, parent: Rid) -> Result<Vec<(Rid, PlinkRecord)>> {
        let mut out = Vec::new();
        for item in self.plink_children.scan_prefix(parent.to_key()) {
            let (key, bytes) = item?;
            out.push((Rid::from_key(&key[8..]), decode(&bytes)?));
        }
        Ok(out)
    }

    pub fn primary_parent(&self, child: Rid) -> Result<Option<Rid>> {
        for (parent, record) in self.parents_of(child)? {
            if record.is_primary {
                return Ok(Some(parent));
            }
        }
        Ok(None)
    }

    pub fn iter_plinks(&self) -> impl Iterator<Item = Result<(Rid, Rid, PlinkRecord)>> + '_ {
        // key is child || parent
        self.plink.iter().map(|result| {
            let (key, bytes) = result?;
            Ok((
                Rid::from_key(&key[8..]),
                Rid::from_key(&key[..8]),
                decode(&bytes)?,
            ))
        })
    }

    // -- mlink -------------------------------------------------------------

    pub fn put_mlink(&self, mid: Rid, fnid: i64, record: &MlinkRecord) -> Result<()> {
        self.mlink
            .insert(pair_key(mid, Rid(fnid)), encode(record)?)?;
        Ok(())
    }

    pub fn mlinks_of(&self, mid: Rid) -> Result<Vec<(i64, MlinkRecord)>> {
        let mut out = Vec::new();
        for item in self.mlink.scan_prefix(mid.to_key()) {
            let (key, bytes) = item?;
            out.push((Rid::from_key(&key[8..]).0, decode(&bytes)?));
        }
        Ok(out)
    }

    /// All change rows as (mid, fnid, record).
    pub fn iter_mlinks(&self) -> impl Iterator<Item = Result<(Rid, i64, MlinkRecord)>> + '_ {
        self.mlink.iter().map(|result| {
            let (key, bytes) = result?;
            Ok((
                Rid::from_key(&key[..8]),
                Rid::from_key(&key[8..]).0,
                decode(&bytes)?,
            ))
        })
    }

    /// Drop every change row of one checkin before a re-link pass.
    pub fn clear_mlinks(&self, mid: Rid) -> Result<()> {
        let keys: Vec<_> = self
            .mlink
            .scan_prefix(mid.to_key())
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        for key in keys {
            self.mlink.remove(key)?;
        }
        Ok(())
    }

    /// The prior blob of the file whose newer blob is `fid`, if any
    /// change row records one. Full scan; used only to pick delta bases.
    pub fn find_mlink_pid(&self, fid: i64) -> Result<Option<i64>> {
        for item in self.mlink.iter() {
            let (_, bytes) = item?;
            let record: MlinkRecord = decode(&bytes)?;
            if record.fid == fid && record.pid != 0 {
                return Ok(Some(record.pid));
            }
        }
        Ok(None)
    }

    // -- interned names ----------------------------------------------------

    fn intern(
        &self,
        fwd: &sled::Tree,
        rev: &sled::Tree,
        name: &str,
    ) -> Result<i64> {
        if let Some(key) = fwd.get(name.as_bytes())? {
            return Ok(Rid::from_key(&key).0);
        }
        let id = self.db.generate_id()? as i64 + 1;
        fwd.insert(name.as_bytes(), &Rid(id).to_key())?;
        rev.insert(Rid(id).to_key(), name.as_bytes())?;
        Ok(id)
    }

    pub fn intern_filename(&self, name: &str) -> Result<i64> {
        self.intern(&self.filename, &self.filename_rev, name)
    }

    pub fn filename_id(&self, name: &str) -> Result<Option<i64>> {
        Ok(self
            .filename
            .get(name.as_bytes())?
            .map(|k| Rid::from_key(&k).0))
    }

    pub fn filename_of(&self, fnid: i64) -> Result<Option<String>> {
        Ok(self
            .filename_rev
            .get(Rid(fnid).to_key())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn intern_tag(&self, name: &str) -> Result<i64> {
        self.intern(&self.tag, &self.tag_rev, name)
    }

    pub fn tag_id(&self, name: &str) -> Result<Option<i64>> {
        Ok(self.tag.get(name.as_bytes())?.map(|k| Rid::from_key(&k).0))
    }

    pub fn tag_name(&self, tagid: i64) -> Result<Option<String>> {
        Ok(self
            .tag_rev
            .get(Rid(tagid).to_key())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    // -- tagxref -----------------------------------------------------------

    pub fn put_tagxref(&self, tagid: i64, rid: Rid, record: &TagxrefRecord) -> Result<()> {
        self.tagxref
            .insert(pair_key(Rid(tagid), rid), encode(record)?)?;
        Ok(())
    }

    pub fn get_tagxref(&self, tagid: i64, rid: Rid) -> Result<Option<TagxrefRecord>> {
        match self.tagxref.get(pair_key(Rid(tagid), rid))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_tagxref(&self, tagid: i64, rid: Rid) -> Result<()> {
        self.tagxref.remove(pair_key(Rid(tagid), rid))?;
        Ok(())
    }

    pub fn iter_tagxref(&self) -> impl Iterator<Item = Result<(i64, Rid, TagxrefRecord)>> + '_ {
        self.tagxref.iter().map(|result| {
            let (key, bytes) = result?;
            Ok((
                Rid::from_key(&key[..8]).0,
                Rid::from_key(&key[8..]),
                decode(&bytes)?,
            ))
        })
    }

    // -- events ------------------------------------------------------------

    pub fn put_event(&self, rid: Rid, record: &EventRecord) -> Result<()> {
        self.event.insert(rid.to_key(), encode(record)?)?;
        Ok(())
    }

    pub fn get_event(&self, rid: Rid) -> Result<Option<EventRecord>> {
        match self.event.get(rid.to_key())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_event(&self, rid: Rid) -> Result<()> {
        self.event.remove(rid.to_key())?;
        Ok(())
    }

    pub fn iter_events(&self) -> impl Iterator<Item = Result<(Rid, EventRecord)>> + '_ {
        self.event.iter().map(|result| {
            let (key, bytes) = result?;
            Ok((Rid::from_key(&key), decode(&bytes)?))
        })
    }

    // -- wiki / technote ---------------------------------------------------

    pub fn set_wiki_page(&self, title: &str, rid: Rid) -> Result<()> {
        self.wiki.insert(title.as_bytes(), &rid.to_key())?;
        Ok(())
    }

    pub fn wiki_page(&self, title: &str) -> Result<Option<Rid>> {
        Ok(self.wiki.get(title.as_bytes())?.map(|k| Rid::from_key(&k)))
    }

    pub fn set_technote(&self, note_id: &ArtifactId, rid: Rid) -> Result<()> {
        self.technote.insert(note_id.as_bytes(), &rid.to_key())?;
        Ok(())
    }

    pub fn technote(&self, note_id: &ArtifactId) -> Result<Option<Rid>> {
        Ok(self
            .technote
            .get(note_id.as_bytes())?
            .map(|k| Rid::from_key(&k)))
    }

    // -- tickets -----------------------------------------------------------

    pub fn put_ticket(&self, ticket_id: &ArtifactId, record: &TicketRecord) -> Result<()> {
        self.ticket.insert(ticket_id.as_bytes(), encode(record)?)?;
        Ok(())
    }

    pub fn get_ticket(&self, ticket_id: &ArtifactId) -> Result<Option<TicketRecord>> {
        match self.ticket.get(ticket_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn add_ticket_change(&self, ticket_id: &ArtifactId, rid: Rid, mtime: f64) -> Result<()> {
        let mut key = Vec::with_capacity(28);
        key.extend_from_slice(ticket_id.as_bytes());
        key.extend_from_slice(&rid.to_key());
        self.ticketchng.insert(key, encode(&mtime)?)?;
        Ok(())
    }

    pub fn ticket_changes(&self, ticket_id: &ArtifactId) -> Result<Vec<(f64, Rid)>> {
        let mut out = Vec::new();
        for item in self.ticketchng.scan_prefix(ticket_id.as_bytes()) {
            let (key, bytes) = item?;
            out.push((decode(&bytes)?, Rid::from_key(&key[20..])));
        }
        Ok(out)
    }

    // -- attachments -------------------------------------------------------

    pub fn put_attachment(&self, rid: Rid, record: &AttachRecord) -> Result<()> {
        self.attachment.insert(rid.to_key(), encode(record)?)?;
        Ok(())
    }

    pub fn get_attachment(&self, rid: Rid) -> Result<Option<AttachRecord>> {
        match self.attachment.get(rid.to_key())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn attach_key(target: &str, filename: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(target.len() + filename.len() + 1);
        key.extend_from_slice(target.as_bytes());
        key.push(0);
        key.extend_from_slice(filename.as_bytes());
        key
    }

    pub fn latest_attachment(&self, target: &str, filename: &str) -> Result<Option<Rid>> {
        Ok(self
            .attach_latest
            .get(Self::attach_key(target, filename))?
            .map(|k| Rid::from_key(&k)))
    }

    pub fn set_latest_attachment(&self, target: &str, filename: &str, rid: Rid) -> Result<()> {
        self.attach_latest
            .insert(Self::attach_key(target, filename), &rid.to_key())?;
        Ok(())
    }

    // -- maintenance -------------------------------------------------------

    /// Drop every derived tree. The artifact tables survive; a rebuild
    /// pass restores everything dropped here.
    pub fn clear_derived(&self) -> Result<()> {
        for tree in [
            &self.orphan,
            &self.plink,
            &self.plink_children,
            &self.mlink,
            &self.filename,
            &self.filename_rev,
            &self.tag,
            &self.tag_rev,
            &self.tagxref,
            &self.event,
            &self.leaf,
            &self.wiki,
            &self.technote,
            &self.ticket,
            &self.ticketchng,
            &self.attachment,
            &self.attach_latest,
        ] {
            tree.clear()?;
        }
        Ok(())
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn uuid(fill: u8) -> ArtifactId {
        ArtifactId([fill; 20])
    }

    #[test]
    fn test_blob_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let rid = storage.alloc_rid().unwrap();
        let record = BlobRecord {
            uuid: uuid(0xaa),
            size: 42,
            rcvid: 0,
        };
        storage.put_blob(rid, &record).unwrap();
        storage.put_content(rid, b"hello").unwrap();

        assert_eq!(storage.get_blob(rid).unwrap().unwrap(), record);
        assert_eq!(storage.rid_for_uuid(&uuid(0xaa)).unwrap(), Some(rid));
        assert_eq!(storage.get_content(rid).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn test_phantom_tracking() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let rid = storage.alloc_rid().unwrap();
        storage
            .put_blob(
                rid,
                &BlobRecord {
                    uuid: uuid(0x01),
                    size: -1,
                    rcvid: 0,
                },
            )
            .unwrap();
        let phantoms: Vec<Rid> = storage.iter_phantoms().map(|r| r.unwrap()).collect();
        assert_eq!(phantoms, vec![rid]);

        // materialize
        storage
            .put_blob(
                rid,
                &BlobRecord {
                    uuid: uuid(0x01),
                    size: 5,
                    rcvid: 0,
                },
            )
            .unwrap();
        assert_eq!(storage.iter_phantoms().count(), 0);
    }

    #[test]
    fn test_plink_scans() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let parent = Rid(1);
        let a = Rid(2);
        let b = Rid(3);
        storage
            .put_plink(parent, a, &PlinkRecord { is_primary: true, mtime: 1.0 })
            .unwrap();
        storage
            .put_plink(parent, b, &PlinkRecord { is_primary: true, mtime: 2.0 })
            .unwrap();

        let children = storage.children_of(parent).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(storage.primary_parent(a).unwrap(), Some(parent));
        assert_eq!(storage.primary_parent(Rid(99)).unwrap(), None);
    }

    #[test]
    fn test_intern_is_stable() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let a = storage.intern_filename("src/main.rs").unwrap();
        let b = storage.intern_filename("src/main.rs").unwrap();
        let c = storage.intern_filename("src/lib.rs").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            storage.filename_of(a).unwrap().unwrap(),
            "src/main.rs"
        );
    }

    #[test]
    fn test_clear_derived_preserves_artifacts() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let rid = storage.alloc_rid().unwrap();
        storage
            .put_blob(
                rid,
                &BlobRecord {
                    uuid: uuid(0x05),
                    size: 3,
                    rcvid: 0,
                },
            )
            .unwrap();
        storage.put_content(rid, b"abc").unwrap();
        storage
            .put_event(
                rid,
                &EventRecord {
                    etype: EventType::Checkin,
                    mtime: 1.0,
                    user: None,
                    comment: None,
                },
            )
            .unwrap();

        storage.clear_derived().unwrap();
        assert!(storage.get_event(rid).unwrap().is_none());
        assert!(storage.get_blob(rid).unwrap().is_some());
        assert_eq!(storage.get_content(rid).unwrap().unwrap(), b"abc");
    }

    #[test]
    fn test_ticket_changes_ordering() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let tkt = uuid(0x77);
        storage.add_ticket_change(&tkt, Rid(10), 5.0).unwrap();
        storage.add_ticket_change(&tkt, Rid(11), 3.0).unwrap();
        let mut changes = storage.ticket_changes(&tkt).unwrap();
        changes.sort_by(|a, b| a.0.total_cmp(&b.0));
        assert_eq!(changes[0].1, Rid(11));
        assert_eq!(changes[1].1, Rid(10));
    }
}
