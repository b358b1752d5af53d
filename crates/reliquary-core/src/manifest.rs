//! Strict card parser and typed manifest variants
//!
//! A control artifact is a sequence of cards, one per line, each starting
//! with an uppercase letter and appearing in ascending letter order. The
//! set of present cards determines which of the seven variants the
//! artifact is. The parser is deliberately strict: any deviation from the
//! grammar is an error and the byte sequence is treated as opaque file
//! content, never as a control artifact.

use crate::encode::{escape_token, unescape_token};
use crate::hash::md5_hex;
use crate::types::{ArtifactId, FileEntry, FilePerm};
use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

/// Manifest parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("syntax error on line {0}")]
    SyntaxError(usize),
    #[error("manifest checksum mismatch")]
    WrongChecksum,
    #[error("unknown card {0:?} on line {1}")]
    UnknownCard(char, usize),
    #[error("duplicate card {0:?}")]
    DuplicateCard(char),
    #[error("missing required card {0:?}")]
    MissingRequired(char),
    #[error("illegal card combination: {0}")]
    IllegalCombination(&'static str),
    #[error("bad token encoding on line {0}")]
    BadEncoding(usize),
}

type Result<T> = std::result::Result<T, ManifestError>;

/// Scope prefix of a T card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TagScope {
    /// `+name`: applies to the target only
    Add,
    /// `*name`: applies to the target and propagates to descendants
    Propagate,
    /// `-name`: cancels the tag at the target
    Cancel,
}

impl TagScope {
    fn prefix(self) -> char {
        match self {
            TagScope::Add => '+',
            TagScope::Propagate => '*',
            TagScope::Cancel => '-',
        }
    }
}

/// Target of a T card: the manifest itself, or another artifact by id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TagTarget {
    SelfRef,
    Artifact(ArtifactId),
}

/// One tag assignment or cancellation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TagCard {
    pub name: String,
    pub scope: TagScope,
    pub target: TagTarget,
    pub value: Option<String>,
}

/// One cherry-pick or backout annotation (Q card).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cherrypick {
    /// true for a backout (`-uuid`)
    pub backout: bool,
    pub uuid: ArtifactId,
    pub baseline: Option<ArtifactId>,
}

/// One ticket field edit (J card).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TicketField {
    /// true when the value appends to the prior field content (`+name`)
    pub append: bool,
    pub name: String,
    pub value: String,
}

/// A file-tree snapshot at a point in history.
///
/// With a `baseline`, the file list is a patch against the baseline's
/// list: entries here override, delete entries remove.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkin {
    pub baseline: Option<ArtifactId>,
    pub comment: Option<String>,
    pub date: f64,
    pub files: Vec<FileEntry>,
    pub parents: Vec<ArtifactId>,
    pub cherrypicks: Vec<Cherrypick>,
    pub tree_checksum: Option<String>,
    pub tags: Vec<TagCard>,
    pub user: String,
}

/// An inventory of other artifacts, bounding `igot` exchange cost.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    pub members: Vec<ArtifactId>,
}

/// A pure tag artifact: applies or cancels named properties on targets.
#[derive(Clone, Debug, PartialEq)]
pub struct Control {
    pub date: f64,
    pub tags: Vec<TagCard>,
    pub user: Option<String>,
}

/// One revision of a wiki page.
#[derive(Clone, Debug, PartialEq)]
pub struct Wiki {
    pub date: f64,
    pub title: String,
    pub parents: Vec<ArtifactId>,
    pub user: Option<String>,
    pub body: String,
}

/// One batch of ticket field edits.
#[derive(Clone, Debug, PartialEq)]
pub struct Ticket {
    pub date: f64,
    pub ticket_id: ArtifactId,
    pub fields: Vec<TicketField>,
    pub user: String,
}

/// A file attached to a ticket or wiki page; `src == None` detaches.
#[derive(Clone, Debug, PartialEq)]
pub struct Attachment {
    pub date: f64,
    pub filename: String,
    pub target: String,
    pub src: Option<ArtifactId>,
    pub comment: Option<String>,
    pub user: Option<String>,
}

/// A dated timeline entry keyed by its own stable id; newer revisions of
/// the same id replace older ones.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub date: f64,
    pub note_date: f64,
    pub note_id: ArtifactId,
    pub parents: Vec<ArtifactId>,
    pub tags: Vec<TagCard>,
    pub user: Option<String>,
    pub comment: Option<String>,
    pub body: String,
}

/// Typed parse of a control artifact.
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    Checkin(Checkin),
    Cluster(Cluster),
    Control(Control),
    Wiki(Wiki),
    Ticket(Ticket),
    Attachment(Attachment),
    Event(Event),
}

impl Manifest {
    /// Artifact date (D card) where present; clusters are undated.
    pub fn date(&self) -> Option<f64> {
        match self {
            Manifest::Checkin(m) => Some(m.date),
            Manifest::Cluster(_) => None,
            Manifest::Control(m) => Some(m.date),
            Manifest::Wiki(m) => Some(m.date),
            Manifest::Ticket(m) => Some(m.date),
            Manifest::Attachment(m) => Some(m.date),
            Manifest::Event(m) => Some(m.date),
        }
    }

    /// Short variant name for diagnostics and timeline rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::Checkin(_) => "checkin",
            Manifest::Cluster(_) => "cluster",
            Manifest::Control(_) => "control",
            Manifest::Wiki(_) => "wiki",
            Manifest::Ticket(_) => "ticket",
            Manifest::Attachment(_) => "attachment",
            Manifest::Event(_) => "event",
        }
    }
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Parse an ISO-8601 UTC date card token into fractional unix seconds.
pub fn parse_date(token: &str) -> Option<f64> {
    let fmt = if token.len() > 19 {
        "%Y-%m-%dT%H:%M:%S%.f"
    } else {
        "%Y-%m-%dT%H:%M:%S"
    };
    let ndt = NaiveDateTime::parse_from_str(token, fmt).ok()?;
    Some(ndt.and_utc().timestamp_micros() as f64 / 1_000_000.0)
}

/// Render fractional unix seconds as the millisecond-precision card token.
pub fn format_date(seconds: f64) -> String {
    let millis = (seconds * 1000.0).round() as i64;
    let dt = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH);
    dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

const CARD_LETTERS: &[u8] = b"ABCDEFJKLMPQRTUWZ";
const REPEATABLE: &[u8] = b"FJMQT";

const PGP_BEGIN: &[u8] = b"-----BEGIN PGP SIGNED MESSAGE-----";
const PGP_SIGNATURE: &[u8] = b"-----BEGIN PGP SIGNATURE-----";

/// Strip an optional PGP clear-sign envelope; the signature is discarded.
fn strip_pgp_envelope(bytes: &[u8]) -> &[u8] {
    if !bytes.starts_with(PGP_BEGIN) {
        return bytes;
    }
    // skip armor headers through the first blank line
    let mut pos = 0;
    let mut body_start = None;
    while let Some(nl) = bytes[pos..].iter().position(|&b| b == b'\n') {
        let line = &bytes[pos..pos + nl];
        pos += nl + 1;
        if line.is_empty() {
            body_start = Some(pos);
            break;
        }
    }
    let Some(start) = body_start else {
        return bytes;
    };
    // body runs to the signature armor
    let mut end = start;
    let mut scan = start;
    while let Some(nl) = bytes[scan..].iter().position(|&b| b == b'\n') {
        let line = &bytes[scan..scan + nl];
        if line == PGP_SIGNATURE {
            break;
        }
        scan += nl + 1;
        end = scan;
    }
    &bytes[start..end]
}

#[derive(Default)]
struct Cards {
    attachment: Option<(String, String, Option<ArtifactId>)>,
    baseline: Option<ArtifactId>,
    comment: Option<String>,
    date: Option<f64>,
    event: Option<(f64, ArtifactId)>,
    files: Vec<FileEntry>,
    ticket_fields: Vec<TicketField>,
    ticket_id: Option<ArtifactId>,
    wiki_title: Option<String>,
    members: Vec<ArtifactId>,
    parents: Option<Vec<ArtifactId>>,
    cherrypicks: Vec<Cherrypick>,
    tree_checksum: Option<String>,
    tags: Vec<TagCard>,
    user: Option<String>,
    wiki_body: Option<String>,
}

struct Cursor<'a> {
    body: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn read_line(&mut self) -> Result<&'a str> {
        self.line += 1;
        let rest = &self.body[self.pos..];
        let nl = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(ManifestError::SyntaxError(self.line))?;
        self.pos += nl + 1;
        std::str::from_utf8(&rest[..nl]).map_err(|_| ManifestError::SyntaxError(self.line))
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.body.len() - self.pos < len {
            return Err(ManifestError::SyntaxError(self.line));
        }
        let out = &self.body[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn at_end(&self) -> bool {
        self.pos == self.body.len()
    }
}

fn parse_uuid(token: &str, line: usize) -> Result<ArtifactId> {
    ArtifactId::from_hex(token).map_err(|_| ManifestError::SyntaxError(line))
}

fn is_md5_hex(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl Manifest {
    /// Parse the bytes of a control artifact.
    ///
    /// On any error the bytes are not a control artifact; callers store
    /// them as opaque content and skip cross-linking.
    pub fn parse(bytes: &[u8]) -> Result<Manifest> {
        let body = strip_pgp_envelope(bytes);
        if body.is_empty() || body[body.len() - 1] != b'\n' {
            return Err(ManifestError::SyntaxError(0));
        }

        let mut cur = Cursor { body, pos: 0, line: 0 };
        let mut cards = Cards::default();
        let mut last_letter: u8 = 0;
        let mut saw_z = false;

        while !cur.at_end() {
            if saw_z {
                // Z must be the final card
                return Err(ManifestError::SyntaxError(cur.line + 1));
            }
            let z_card_start = cur.pos;
            let line = cur.read_line()?;
            let lineno = cur.line;
            let mut chars = line.bytes();
            let letter = chars.next().ok_or(ManifestError::SyntaxError(lineno))?;
            if !letter.is_ascii_uppercase() {
                return Err(ManifestError::SyntaxError(lineno));
            }
            if !CARD_LETTERS.contains(&letter) {
                return Err(ManifestError::UnknownCard(letter as char, lineno));
            }
            if letter < last_letter {
                return Err(ManifestError::SyntaxError(lineno));
            }
            if letter == last_letter && !REPEATABLE.contains(&letter) {
                return Err(ManifestError::DuplicateCard(letter as char));
            }
            last_letter = letter;

            let args: Vec<&str> = if line.len() == 1 {
                Vec::new()
            } else {
                if line.as_bytes()[1] != b' ' {
                    return Err(ManifestError::SyntaxError(lineno));
                }
                let rest = &line[2..];
                if rest.is_empty() {
                    return Err(ManifestError::SyntaxError(lineno));
                }
                let split: Vec<&str> = rest.split(' ').collect();
                if split.iter().any(|t| t.is_empty()) {
                    return Err(ManifestError::SyntaxError(lineno));
                }
                split
            };

            let decode = |token: &str| -> Result<String> {
                unescape_token(token).map_err(|_| ManifestError::BadEncoding(lineno))
            };

            match letter {
                b'A' => {
                    if args.len() < 2 || args.len() > 3 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    let filename = decode(args[0])?;
                    let target = decode(args[1])?;
                    let src = match args.get(2) {
                        Some(t) => Some(parse_uuid(t, lineno)?),
                        None => None,
                    };
                    cards.attachment = Some((filename, target, src));
                }
                b'B' => {
                    if args.len() != 1 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    cards.baseline = Some(parse_uuid(args[0], lineno)?);
                }
                b'C' => {
                    if args.len() != 1 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    cards.comment = Some(decode(args[0])?);
                }
                b'D' => {
                    if args.len() != 1 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    cards.date =
                        Some(parse_date(args[0]).ok_or(ManifestError::SyntaxError(lineno))?);
                }
                b'E' => {
                    if args.len() != 2 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    let when = parse_date(args[0]).ok_or(ManifestError::SyntaxError(lineno))?;
                    cards.event = Some((when, parse_uuid(args[1], lineno)?));
                }
                b'F' => {
                    if args.is_empty() || args.len() > 4 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    let name = decode(args[0])?;
                    if let Some(prev) = cards.files.last() {
                        // duplicate or out-of-order file names break the
                        // lockstep merge with baselines
                        if prev.name >= name {
                            return Err(ManifestError::SyntaxError(lineno));
                        }
                    }
                    let uuid = match args.get(1) {
                        Some(t) => Some(parse_uuid(t, lineno)?),
                        None => None,
                    };
                    let perm = match args.get(2) {
                        Some(t) => {
                            FilePerm::from_token(t).ok_or(ManifestError::SyntaxError(lineno))?
                        }
                        None => FilePerm::Regular,
                    };
                    let prior_name = match args.get(3) {
                        Some(t) => Some(decode(t)?),
                        None => None,
                    };
                    cards.files.push(FileEntry {
                        name,
                        uuid,
                        perm,
                        prior_name,
                    });
                }
                b'J' => {
                    if args.is_empty() || args.len() > 2 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    let raw_name = decode(args[0])?;
                    let (append, name) = match raw_name.strip_prefix('+') {
                        Some(stripped) => (true, stripped.to_string()),
                        None => (false, raw_name),
                    };
                    if name.is_empty() {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    let value = match args.get(1) {
                        Some(t) => decode(t)?,
                        None => String::new(),
                    };
                    cards.ticket_fields.push(TicketField {
                        append,
                        name,
                        value,
                    });
                }
                b'K' => {
                    if args.len() != 1 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    cards.ticket_id = Some(parse_uuid(args[0], lineno)?);
                }
                b'L' => {
                    if args.len() != 1 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    cards.wiki_title = Some(decode(args[0])?);
                }
                b'M' => {
                    if args.len() != 1 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    cards.members.push(parse_uuid(args[0], lineno)?);
                }
                b'P' => {
                    if cards.parents.is_some() {
                        return Err(ManifestError::DuplicateCard('P'));
                    }
                    let mut parents = Vec::with_capacity(args.len());
                    for arg in &args {
                        parents.push(parse_uuid(arg, lineno)?);
                    }
                    cards.parents = Some(parents);
                }
                b'Q' => {
                    if args.is_empty() || args.len() > 2 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    let (backout, uuid_part) = match args[0].as_bytes().first() {
                        Some(b'+') => (false, &args[0][1..]),
                        Some(b'-') => (true, &args[0][1..]),
                        _ => return Err(ManifestError::SyntaxError(lineno)),
                    };
                    let baseline = match args.get(1) {
                        Some(t) => Some(parse_uuid(t, lineno)?),
                        None => None,
                    };
                    cards.cherrypicks.push(Cherrypick {
                        backout,
                        uuid: parse_uuid(uuid_part, lineno)?,
                        baseline,
                    });
                }
                b'R' => {
                    if args.len() != 1 || !is_md5_hex(args[0]) {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    cards.tree_checksum = Some(args[0].to_string());
                }
                b'T' => {
                    if args.len() < 2 || args.len() > 3 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    let raw = decode(args[0])?;
                    let mut it = raw.chars();
                    let scope = match it.next() {
                        Some('+') => TagScope::Add,
                        Some('*') => TagScope::Propagate,
                        Some('-') => TagScope::Cancel,
                        _ => return Err(ManifestError::SyntaxError(lineno)),
                    };
                    let name: String = it.collect();
                    if name.is_empty() {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    let target = if args[1] == "*" {
                        TagTarget::SelfRef
                    } else {
                        TagTarget::Artifact(parse_uuid(args[1], lineno)?)
                    };
                    let value = match args.get(2) {
                        Some(t) => Some(decode(t)?),
                        None => None,
                    };
                    cards.tags.push(TagCard {
                        name,
                        scope,
                        target,
                        value,
                    });
                }
                b'U' => {
                    if args.len() != 1 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    cards.user = Some(decode(args[0])?);
                }
                b'W' => {
                    if args.len() != 1 {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    let len: usize = args[0]
                        .parse()
                        .map_err(|_| ManifestError::SyntaxError(lineno))?;
                    let raw = cur.read_exact(len)?;
                    let body = std::str::from_utf8(raw)
                        .map_err(|_| ManifestError::SyntaxError(lineno))?
                        .to_string();
                    if cur.read_exact(1)? != b"\n" {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    cards.wiki_body = Some(body);
                }
                b'Z' => {
                    if args.len() != 1 || !is_md5_hex(args[0]) {
                        return Err(ManifestError::SyntaxError(lineno));
                    }
                    let computed = md5_hex(&body[..z_card_start]);
                    if computed != args[0] {
                        return Err(ManifestError::WrongChecksum);
                    }
                    saw_z = true;
                }
                _ => unreachable!(),
            }
        }

        if !saw_z {
            return Err(ManifestError::MissingRequired('Z'));
        }
        classify(cards)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Apply the exclusive variant rules, first match wins.
fn classify(cards: Cards) -> Result<Manifest> {
    let Cards {
        attachment,
        baseline,
        comment,
        date,
        event,
        files,
        ticket_fields,
        ticket_id,
        wiki_title,
        members,
        parents,
        cherrypicks,
        tree_checksum,
        tags,
        user,
        wiki_body,
    } = cards;

    // 1. F, R, or B present: checkin
    if !files.is_empty() || tree_checksum.is_some() || baseline.is_some() {
        if !members.is_empty()
            || !ticket_fields.is_empty()
            || ticket_id.is_some()
            || wiki_body.is_some()
            || wiki_title.is_some()
            || event.is_some()
            || attachment.is_some()
        {
            return Err(ManifestError::IllegalCombination(
                "checkin with non-checkin cards",
            ));
        }
        if baseline.is_none() && files.iter().any(|f| f.is_delete()) {
            return Err(ManifestError::IllegalCombination(
                "delete file entry without baseline",
            ));
        }
        return Ok(Manifest::Checkin(Checkin {
            baseline,
            comment,
            date: date.ok_or(ManifestError::MissingRequired('D'))?,
            files,
            parents: parents.unwrap_or_default(),
            cherrypicks,
            tree_checksum,
            tags,
            user: user.ok_or(ManifestError::MissingRequired('U'))?,
        }));
    }

    // 2. M present: cluster, nothing else allowed
    if !members.is_empty() {
        if date.is_some()
            || comment.is_some()
            || user.is_some()
            || !tags.is_empty()
            || parents.is_some()
            || !ticket_fields.is_empty()
            || ticket_id.is_some()
            || wiki_body.is_some()
            || wiki_title.is_some()
            || event.is_some()
            || attachment.is_some()
            || !cherrypicks.is_empty()
        {
            return Err(ManifestError::IllegalCombination(
                "cluster with non-cluster cards",
            ));
        }
        return Ok(Manifest::Cluster(Cluster { members }));
    }

    // 3. J present: ticket change
    if !ticket_fields.is_empty() {
        if wiki_body.is_some()
            || wiki_title.is_some()
            || event.is_some()
            || attachment.is_some()
            || comment.is_some()
            || parents.is_some()
            || !tags.is_empty()
            || !cherrypicks.is_empty()
        {
            return Err(ManifestError::IllegalCombination(
                "ticket with non-ticket cards",
            ));
        }
        return Ok(Manifest::Ticket(Ticket {
            date: date.ok_or(ManifestError::MissingRequired('D'))?,
            ticket_id: ticket_id.ok_or(ManifestError::MissingRequired('K'))?,
            fields: ticket_fields,
            user: user.ok_or(ManifestError::MissingRequired('U'))?,
        }));
    }

    // 4. E present: event
    if let Some((note_date, note_id)) = event {
        if ticket_id.is_some()
            || wiki_title.is_some()
            || attachment.is_some()
            || !cherrypicks.is_empty()
        {
            return Err(ManifestError::IllegalCombination(
                "event with non-event cards",
            ));
        }
        // event tags bind to the event itself and never propagate
        if tags
            .iter()
            .any(|t| t.scope == TagScope::Propagate || t.target != TagTarget::SelfRef)
        {
            return Err(ManifestError::IllegalCombination(
                "event tag with propagation or foreign target",
            ));
        }
        return Ok(Manifest::Event(Event {
            date: date.ok_or(ManifestError::MissingRequired('D'))?,
            note_date,
            note_id,
            parents: parents.unwrap_or_default(),
            tags,
            user,
            comment,
            body: wiki_body.ok_or(ManifestError::MissingRequired('W'))?,
        }));
    }

    // 5. W present: wiki
    if let Some(body) = wiki_body {
        if ticket_id.is_some()
            || attachment.is_some()
            || comment.is_some()
            || !tags.is_empty()
            || !cherrypicks.is_empty()
        {
            return Err(ManifestError::IllegalCombination("wiki with non-wiki cards"));
        }
        return Ok(Manifest::Wiki(Wiki {
            date: date.ok_or(ManifestError::MissingRequired('D'))?,
            title: wiki_title.ok_or(ManifestError::MissingRequired('L'))?,
            parents: parents.unwrap_or_default(),
            user,
            body,
        }));
    }

    // 6. T cards only: control
    if !tags.is_empty() {
        if parents.is_some() {
            return Err(ManifestError::IllegalCombination("control with parents"));
        }
        if ticket_id.is_some()
            || wiki_title.is_some()
            || attachment.is_some()
            || comment.is_some()
            || !cherrypicks.is_empty()
        {
            return Err(ManifestError::IllegalCombination(
                "control with non-control cards",
            ));
        }
        return Ok(Manifest::Control(Control {
            date: date.ok_or(ManifestError::MissingRequired('D'))?,
            tags,
            user,
        }));
    }

    // 7. A present: attachment
    if let Some((filename, target, src)) = attachment {
        if ticket_id.is_some()
            || wiki_title.is_some()
            || parents.is_some()
            || !cherrypicks.is_empty()
        {
            return Err(ManifestError::IllegalCombination(
                "attachment with non-attachment cards",
            ));
        }
        return Ok(Manifest::Attachment(Attachment {
            date: date.ok_or(ManifestError::MissingRequired('D'))?,
            filename,
            target,
            src,
            comment,
            user,
        }));
    }

    // 8. fallback: a checkin with no files (root commit)
    if ticket_id.is_some() || wiki_title.is_some() {
        return Err(ManifestError::IllegalCombination("stray K or L card"));
    }
    Ok(Manifest::Checkin(Checkin {
        baseline: None,
        comment,
        date: date.ok_or(ManifestError::MissingRequired('D'))?,
        files: Vec::new(),
        parents: parents.unwrap_or_default(),
        cherrypicks,
        tree_checksum: None,
        tags: Vec::new(),
        user: user.ok_or(ManifestError::MissingRequired('U'))?,
    }))
}

// ---------------------------------------------------------------------------
// Effective file list
// ---------------------------------------------------------------------------

/// Lockstep merge of a delta checkin's file list over its baseline.
///
/// Both lists are sorted by name (enforced at parse). Overlay entries
/// replace baseline entries of the same name; overlay delete entries drop
/// them; everything else passes through.
pub struct FileIter<'a> {
    overlay: &'a [FileEntry],
    base: &'a [FileEntry],
    i: usize,
    j: usize,
}

impl<'a> Iterator for FileIter<'a> {
    type Item = &'a FileEntry;

    fn next(&mut self) -> Option<&'a FileEntry> {
        loop {
            let o = self.overlay.get(self.i);
            let b = self.base.get(self.j);
            match (o, b) {
                (Some(ov), Some(ba)) => {
                    if ov.name < ba.name {
                        self.i += 1;
                        if ov.is_delete() {
                            continue;
                        }
                        return Some(ov);
                    } else if ov.name == ba.name {
                        self.i += 1;
                        self.j += 1;
                        if ov.is_delete() {
                            continue;
                        }
                        return Some(ov);
                    } else {
                        self.j += 1;
                        return Some(ba);
                    }
                }
                (Some(ov), None) => {
                    self.i += 1;
                    if ov.is_delete() {
                        continue;
                    }
                    return Some(ov);
                }
                (None, Some(ba)) => {
                    self.j += 1;
                    return Some(ba);
                }
                (None, None) => return None,
            }
        }
    }
}

impl Checkin {
    /// Iterate the effective file list.
    ///
    /// For a delta checkin the caller supplies the resolved baseline;
    /// passing `None` iterates the raw F cards.
    pub fn files_with<'a>(&'a self, baseline: Option<&'a Checkin>) -> FileIter<'a> {
        FileIter {
            overlay: &self.files,
            base: baseline.map(|b| b.files.as_slice()).unwrap_or(&[]),
            i: 0,
            j: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

fn push_card(out: &mut String, letter: char, tokens: &[&str]) {
    out.push(letter);
    for t in tokens {
        out.push(' ');
        out.push_str(t);
    }
    out.push('\n');
}

fn push_tag_cards(out: &mut String, tags: &[TagCard]) {
    let mut lines: Vec<String> = tags
        .iter()
        .map(|t| {
            let mut line = format!(
                "T {}{}",
                t.scope.prefix(),
                escape_token(&t.name)
            );
            line.push(' ');
            match t.target {
                TagTarget::SelfRef => line.push('*'),
                TagTarget::Artifact(id) => line.push_str(&id.to_hex()),
            }
            if let Some(value) = &t.value {
                line.push(' ');
                line.push_str(&escape_token(value));
            }
            line
        })
        .collect();
    lines.sort();
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
}

fn push_file_cards(out: &mut String, files: &[FileEntry]) {
    for f in files {
        let mut line = format!("F {}", escape_token(&f.name));
        if let Some(uuid) = f.uuid {
            line.push(' ');
            line.push_str(&uuid.to_hex());
        }
        if let Some(perm) = f.perm.as_token() {
            line.push(' ');
            line.push_str(perm);
        }
        if let Some(prior) = &f.prior_name {
            if f.perm == FilePerm::Regular {
                // rename of a regular file still needs the perm slot filled
                line.push_str(" w");
            }
            line.push(' ');
            line.push_str(&escape_token(prior));
        }
        out.push_str(&line);
        out.push('\n');
    }
}

impl Manifest {
    /// Serialize to card bytes, Z trailer included.
    ///
    /// Repeating cards are emitted sorted, so serialize-then-parse
    /// round-trips every variant whose collections are sorted.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        match self {
            Manifest::Checkin(m) => {
                if let Some(baseline) = m.baseline {
                    push_card(&mut out, 'B', &[&baseline.to_hex()]);
                }
                if let Some(comment) = &m.comment {
                    push_card(&mut out, 'C', &[&escape_token(comment)]);
                }
                push_card(&mut out, 'D', &[&format_date(m.date)]);
                push_file_cards(&mut out, &m.files);
                if !m.parents.is_empty() {
                    let hexes: Vec<String> = m.parents.iter().map(|p| p.to_hex()).collect();
                    let refs: Vec<&str> = hexes.iter().map(|s| s.as_str()).collect();
                    push_card(&mut out, 'P', &refs);
                }
                for q in &m.cherrypicks {
                    let first = format!(
                        "{}{}",
                        if q.backout { '-' } else { '+' },
                        q.uuid.to_hex()
                    );
                    match q.baseline {
                        Some(b) => push_card(&mut out, 'Q', &[&first, &b.to_hex()]),
                        None => push_card(&mut out, 'Q', &[&first]),
                    }
                }
                if let Some(sum) = &m.tree_checksum {
                    push_card(&mut out, 'R', &[sum]);
                }
                push_tag_cards(&mut out, &m.tags);
                push_card(&mut out, 'U', &[&escape_token(&m.user)]);
            }
            Manifest::Cluster(m) => {
                let mut members = m.members.clone();
                members.sort();
                for member in members {
                    push_card(&mut out, 'M', &[&member.to_hex()]);
                }
            }
            Manifest::Control(m) => {
                push_card(&mut out, 'D', &[&format_date(m.date)]);
                push_tag_cards(&mut out, &m.tags);
                if let Some(user) = &m.user {
                    push_card(&mut out, 'U', &[&escape_token(user)]);
                }
            }
            Manifest::Wiki(m) => {
                push_card(&mut out, 'D', &[&format_date(m.date)]);
                push_card(&mut out, 'L', &[&escape_token(&m.title)]);
                if !m.parents.is_empty() {
                    let hexes: Vec<String> = m.parents.iter().map(|p| p.to_hex()).collect();
                    let refs: Vec<&str> = hexes.iter().map(|s| s.as_str()).collect();
                    push_card(&mut out, 'P', &refs);
                }
                if let Some(user) = &m.user {
                    push_card(&mut out, 'U', &[&escape_token(user)]);
                }
                out.push_str(&format!("W {}\n", m.body.len()));
                out.push_str(&m.body);
                out.push('\n');
            }
            Manifest::Ticket(m) => {
                push_card(&mut out, 'D', &[&format_date(m.date)]);
                let mut fields = m.fields.clone();
                fields.sort_by(|a, b| a.name.cmp(&b.name));
                for f in fields {
                    let name = if f.append {
                        format!("+{}", escape_token(&f.name))
                    } else {
                        escape_token(&f.name)
                    };
                    if f.value.is_empty() {
                        push_card(&mut out, 'J', &[&name]);
                    } else {
                        push_card(&mut out, 'J', &[&name, &escape_token(&f.value)]);
                    }
                }
                push_card(&mut out, 'K', &[&m.ticket_id.to_hex()]);
                push_card(&mut out, 'U', &[&escape_token(&m.user)]);
            }
            Manifest::Attachment(m) => {
                let filename = escape_token(&m.filename);
                let target = escape_token(&m.target);
                match m.src {
                    Some(src) => push_card(&mut out, 'A', &[&filename, &target, &src.to_hex()]),
                    None => push_card(&mut out, 'A', &[&filename, &target]),
                }
                if let Some(comment) = &m.comment {
                    push_card(&mut out, 'C', &[&escape_token(comment)]);
                }
                push_card(&mut out, 'D', &[&format_date(m.date)]);
                if let Some(user) = &m.user {
                    push_card(&mut out, 'U', &[&escape_token(user)]);
                }
            }
            Manifest::Event(m) => {
                if let Some(comment) = &m.comment {
                    push_card(&mut out, 'C', &[&escape_token(comment)]);
                }
                push_card(&mut out, 'D', &[&format_date(m.date)]);
                push_card(
                    &mut out,
                    'E',
                    &[&format_date(m.note_date), &m.note_id.to_hex()],
                );
                if !m.parents.is_empty() {
                    let hexes: Vec<String> = m.parents.iter().map(|p| p.to_hex()).collect();
                    let refs: Vec<&str> = hexes.iter().map(|s| s.as_str()).collect();
                    push_card(&mut out, 'P', &refs);
                }
                push_tag_cards(&mut out, &m.tags);
                if let Some(user) = &m.user {
                    push_card(&mut out, 'U', &[&escape_token(user)]);
                }
                out.push_str(&format!("W {}\n", m.body.len()));
                out.push_str(&m.body);
                out.push('\n');
            }
        }
        let digest = md5_hex(out.as_bytes());
        out.push_str(&format!("Z {}\n", digest));
        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::artifact_id;

    fn uuid(fill: u8) -> ArtifactId {
        ArtifactId([fill; 20])
    }

    fn sample_checkin() -> Checkin {
        Checkin {
            baseline: None,
            comment: Some("fix the frobnicator".into()),
            date: 1_700_000_000.5,
            files: vec![
                FileEntry::new("src/a.rs", uuid(0x11)),
                FileEntry::new("src/b.rs", uuid(0x22)),
            ],
            parents: vec![uuid(0x33)],
            cherrypicks: vec![],
            tree_checksum: None,
            tags: vec![],
            user: "alice".into(),
        }
    }

    #[test]
    fn test_checkin_roundtrip() {
        let m = Manifest::Checkin(sample_checkin());
        let bytes = m.to_bytes();
        let parsed = Manifest::parse(&bytes).unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn test_all_variants_roundtrip() {
        let variants = vec![
            Manifest::Checkin(sample_checkin()),
            Manifest::Cluster(Cluster {
                members: vec![uuid(0x01), uuid(0x02), uuid(0x03)],
            }),
            Manifest::Control(Control {
                date: 1_700_000_100.0,
                tags: vec![TagCard {
                    name: "branch".into(),
                    scope: TagScope::Propagate,
                    target: TagTarget::Artifact(uuid(0x44)),
                    value: Some("trunk".into()),
                }],
                user: Some("bob".into()),
            }),
            Manifest::Wiki(Wiki {
                date: 1_700_000_200.0,
                title: "Release Notes".into(),
                parents: vec![uuid(0x55)],
                user: Some("carol".into()),
                body: "first line\nsecond line\n".into(),
            }),
            Manifest::Ticket(Ticket {
                date: 1_700_000_300.0,
                ticket_id: uuid(0x66),
                fields: vec![
                    TicketField {
                        append: false,
                        name: "status".into(),
                        value: "open".into(),
                    },
                    TicketField {
                        append: true,
                        name: "text".into(),
                        value: "more detail".into(),
                    },
                ],
                user: "dave".into(),
            }),
            Manifest::Attachment(Attachment {
                date: 1_700_000_400.0,
                filename: "crash log.txt".into(),
                target: uuid(0x77).to_hex(),
                src: Some(uuid(0x88)),
                comment: Some("from the field".into()),
                user: Some("erin".into()),
            }),
            Manifest::Event(Event {
                date: 1_700_000_500.0,
                note_date: 1_700_003_600.0,
                note_id: uuid(0x99),
                parents: vec![],
                tags: vec![],
                user: Some("frank".into()),
                comment: None,
                body: "note body".into(),
            }),
        ];
        for m in variants {
            let bytes = m.to_bytes();
            let parsed = Manifest::parse(&bytes)
                .unwrap_or_else(|e| panic!("{} failed: {e}", m.kind()));
            assert_eq!(parsed.kind(), m.kind());
            assert_eq!(parsed, m);
        }
    }

    #[test]
    fn test_fallback_root_checkin() {
        let m = Manifest::Checkin(Checkin {
            baseline: None,
            comment: Some("initial empty check-in".into()),
            date: 1_700_000_000.0,
            files: vec![],
            parents: vec![],
            cherrypicks: vec![],
            tree_checksum: None,
            tags: vec![],
            user: "alice".into(),
        });
        let parsed = Manifest::parse(&m.to_bytes()).unwrap();
        assert!(matches!(parsed, Manifest::Checkin(ref c) if c.files.is_empty()));
    }

    #[test]
    fn test_checksum_is_verified() {
        let mut bytes = Manifest::Checkin(sample_checkin()).to_bytes();
        // corrupt the comment without fixing Z
        let pos = bytes.windows(3).position(|w| w == b"fix").unwrap();
        bytes[pos] = b'F';
        assert_eq!(Manifest::parse(&bytes), Err(ManifestError::WrongChecksum));
    }

    #[test]
    fn test_missing_z_rejected() {
        let text = format!("C hello\nD 2023-11-14T22:13:20.000\nU alice\n");
        assert_eq!(
            Manifest::parse(text.as_bytes()),
            Err(ManifestError::MissingRequired('Z'))
        );
    }

    #[test]
    fn test_card_order_enforced() {
        let body = "D 2023-11-14T22:13:20.000\nC out-of-order\nU alice\n";
        let text = format!("{body}Z {}\n", md5_hex(body.as_bytes()));
        assert!(matches!(
            Manifest::parse(text.as_bytes()),
            Err(ManifestError::SyntaxError(_))
        ));
    }

    #[test]
    fn test_duplicate_card_rejected() {
        let body = "C one\nD 2023-11-14T22:13:20.000\nD 2023-11-14T22:13:21.000\nU alice\n";
        let text = format!("{body}Z {}\n", md5_hex(body.as_bytes()));
        assert_eq!(
            Manifest::parse(text.as_bytes()),
            Err(ManifestError::DuplicateCard('D'))
        );
    }

    #[test]
    fn test_unknown_card_rejected() {
        let body = "C one\nD 2023-11-14T22:13:20.000\nN surprise\nU alice\n";
        let text = format!("{body}Z {}\n", md5_hex(body.as_bytes()));
        assert_eq!(
            Manifest::parse(text.as_bytes()),
            Err(ManifestError::UnknownCard('N', 3))
        );
    }

    #[test]
    fn test_ordinary_content_is_not_a_manifest() {
        assert!(Manifest::parse(b"just some file content\n").is_err());
        assert!(Manifest::parse(b"").is_err());
        assert!(Manifest::parse(b"no trailing newline").is_err());
        assert!(Manifest::parse(&[0xff, 0xfe, 0x00, b'\n']).is_err());
    }

    #[test]
    fn test_out_of_order_files_rejected() {
        let body = format!(
            "D 2023-11-14T22:13:20.000\nF b.txt {}\nF a.txt {}\nU alice\n",
            uuid(0x11).to_hex(),
            uuid(0x22).to_hex()
        );
        let text = format!("{body}Z {}\n", md5_hex(body.as_bytes()));
        assert!(matches!(
            Manifest::parse(text.as_bytes()),
            Err(ManifestError::SyntaxError(_))
        ));
    }

    #[test]
    fn test_illegal_combination() {
        // cluster members plus a date card
        let body = format!("D 2023-11-14T22:13:20.000\nM {}\n", uuid(0x11).to_hex());
        let text = format!("{body}Z {}\n", md5_hex(body.as_bytes()));
        assert!(matches!(
            Manifest::parse(text.as_bytes()),
            Err(ManifestError::IllegalCombination(_))
        ));
    }

    #[test]
    fn test_delta_manifest_file_merge() {
        let baseline = Checkin {
            files: vec![
                FileEntry::new("a.txt", uuid(0x01)),
                FileEntry::new("b.txt", uuid(0x02)),
                FileEntry::new("c.txt", uuid(0x03)),
            ],
            ..sample_checkin()
        };
        let delta = Checkin {
            baseline: Some(artifact_id(b"baseline")),
            files: vec![
                // replace b.txt, delete c.txt, add d.txt
                FileEntry::new("b.txt", uuid(0x22)),
                FileEntry {
                    name: "c.txt".into(),
                    uuid: None,
                    perm: FilePerm::Regular,
                    prior_name: None,
                },
                FileEntry::new("d.txt", uuid(0x04)),
            ],
            ..sample_checkin()
        };
        let effective: Vec<(String, ArtifactId)> = delta
            .files_with(Some(&baseline))
            .map(|f| (f.name.clone(), f.uuid.unwrap()))
            .collect();
        assert_eq!(
            effective,
            vec![
                ("a.txt".to_string(), uuid(0x01)),
                ("b.txt".to_string(), uuid(0x22)),
                ("d.txt".to_string(), uuid(0x04)),
            ]
        );
    }

    #[test]
    fn test_delete_entry_requires_baseline() {
        let body = format!("D 2023-11-14T22:13:20.000\nF gone.txt\nU alice\n");
        let text = format!("{body}Z {}\n", md5_hex(body.as_bytes()));
        assert!(matches!(
            Manifest::parse(text.as_bytes()),
            Err(ManifestError::IllegalCombination(_))
        ));
    }

    #[test]
    fn test_pgp_envelope_stripped() {
        let inner = Manifest::Checkin(sample_checkin()).to_bytes();
        let mut wrapped = Vec::new();
        wrapped.extend_from_slice(b"-----BEGIN PGP SIGNED MESSAGE-----\n");
        wrapped.extend_from_slice(b"Hash: SHA1\n\n");
        wrapped.extend_from_slice(&inner);
        wrapped.extend_from_slice(b"-----BEGIN PGP SIGNATURE-----\n");
        wrapped.extend_from_slice(b"fake sig\n");
        wrapped.extend_from_slice(b"-----END PGP SIGNATURE-----\n");
        let parsed = Manifest::parse(&wrapped).unwrap();
        assert_eq!(parsed, Manifest::parse(&inner).unwrap());
    }

    #[test]
    fn test_filenames_are_unescaped() {
        let m = Manifest::Checkin(Checkin {
            files: vec![FileEntry::new("dir/with space.txt", uuid(0x11))],
            ..sample_checkin()
        });
        let bytes = m.to_bytes();
        assert!(!String::from_utf8_lossy(&bytes).contains("with space"));
        match Manifest::parse(&bytes).unwrap() {
            Manifest::Checkin(c) => assert_eq!(c.files[0].name, "dir/with space.txt"),
            other => panic!("wrong variant {}", other.kind()),
        }
    }

    #[test]
    fn test_date_roundtrip() {
        let token = "2023-11-14T22:13:20.123";
        let secs = parse_date(token).unwrap();
        assert_eq!(format_date(secs), token);
        assert!(parse_date("2023-11-14 22:13:20").is_none());
        assert!(parse_date("not a date").is_none());
    }
}
