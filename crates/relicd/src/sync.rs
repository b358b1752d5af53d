//! Card-oriented sync protocol engine
//!
//! One message is a sequence of cards, one per line, with raw payloads
//! following length-carrying cards. The client opens with `clone`, `pull`
//! or `push`, asks for missing content with `gimme`, advertises inventory
//! with `igot`, and closes with a `login` card whose nonce signs
//! everything above it. The server is stateless between messages: it
//! reads a whole request, replies in kind, and relies on the store's
//! content addressing to make every round idempotent.

use crate::auth::{self, AuthError, Capabilities};
use crate::crosslink::{Crosslinker, CrosslinkError};
use crate::storage::StorageError;
use crate::store::{unix_now, Repository, StoreError};
use reliquary_core::delta;
use reliquary_core::encode::{escape_token, unescape_token};
use reliquary_core::hash::{login_signature, request_nonce};
use reliquary_core::manifest::{format_date, parse_date};
use reliquary_core::types::{ArtifactId, Rid};
use reliquary_net::body::{self, BodyError, ContentType};
use reliquary_net::reader::{LineReader, ReadError};
use reliquary_net::transport::{Peer, TransportError};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Client outbound byte cap per round.
pub const MAX_UPLOAD: usize = 250 * 1024;

/// Server reply byte cap per round.
pub const MAX_DOWNLOAD: usize = 5 * 1024 * 1024;

/// Most `gimme` cards either side emits per round.
pub const MAX_GIMME: usize = 500;

/// Base clock-skew warning threshold in seconds.
pub const CLOCK_SKEW_WARN: f64 = 10.0;

/// Streaming clone protocol version.
pub const CLONE_VERSION: u32 = 2;

/// Bound on sync rounds; a healthy session converges far earlier.
const MAX_ROUNDS: u32 = 64;

/// Login attempts before the client gives up.
const MAX_LOGIN_RETRIES: u32 = 2;

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Crosslink error: {0}")]
    Crosslink(#[from] CrosslinkError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Read error: {0}")]
    Read(#[from] ReadError),
    #[error("Body error: {0}")]
    Body(#[from] BodyError),
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("login failed")]
    LoginFailed,
}

type Result<T> = std::result::Result<T, SyncError>;

// ---------------------------------------------------------------------------
// Cards
// ---------------------------------------------------------------------------

/// One parsed wire card.
#[derive(Clone, Debug, PartialEq)]
pub enum Card {
    Login {
        user: String,
        nonce: String,
        sig: String,
        /// Bytes of the message the nonce signs (everything above login)
        signed_len: usize,
    },
    Pull {
        server: String,
        project: String,
    },
    Push {
        server: String,
        project: String,
    },
    Clone {
        version: u32,
        seqno: u64,
    },
    File {
        uuid: ArtifactId,
        src: Option<ArtifactId>,
        payload: Vec<u8>,
    },
    CFile {
        uuid: ArtifactId,
        src: Option<ArtifactId>,
        payload: Vec<u8>,
    },
    Gimme(ArtifactId),
    IGot {
        uuid: ArtifactId,
        private: bool,
    },
    Private,
    ReqConfig(String),
    Config {
        name: String,
        payload: Vec<u8>,
    },
    Cookie(String),
    Pragma(String),
    CloneSeqno(u64),
    Message(String),
    ErrorCard(String),
    Comment(String),
}

fn parse_uuid(token: &str) -> Result<ArtifactId> {
    ArtifactId::from_hex(token)
        .map_err(|_| SyncError::Protocol(format!("bad artifact id {:?}", token)))
}

fn parse_len(token: &str) -> Result<usize> {
    token
        .parse()
        .map_err(|_| SyncError::Protocol(format!("bad length {:?}", token)))
}

/// Tokenize a whole message body into cards, consuming payloads by their
/// declared lengths so payload bytes are never mistaken for cards.
pub fn parse_message(raw: &[u8]) -> Result<Vec<Card>> {
    let mut reader = LineReader::new(raw);
    let mut cards = Vec::new();
    let mut consumed = 0usize;
    while let Some(line) = reader.next_line()? {
        let line_start = consumed;
        consumed = raw.len() - reader.remaining();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('#') {
            cards.push(Card::Comment(rest.trim().to_string()));
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&verb) = tokens.first() else {
            continue;
        };
        let args = &tokens[1..];
        let card = match verb {
            "login" if args.len() == 3 => Card::Login {
                user: args[0].into(),
                nonce: args[1].into(),
                sig: args[2].into(),
                signed_len: line_start,
            },
            "pull" if args.len() == 2 => Card::Pull {
                server: args[0].into(),
                project: args[1].into(),
            },
            "push" if args.len() == 2 => Card::Push {
                server: args[0].into(),
                project: args[1].into(),
            },
            "clone" => {
                let version = args.first().map(|t| parse_len(t)).transpose()?;
                let seqno = args.get(1).map(|t| parse_len(t)).transpose()?;
                Card::Clone {
                    version: version.unwrap_or(1) as u32,
                    seqno: seqno.unwrap_or(1) as u64,
                }
            }
            "file" if args.len() == 2 || args.len() == 3 => {
                let uuid = parse_uuid(args[0])?;
                let src = if args.len() == 3 {
                    Some(parse_uuid(args[1])?)
                } else {
                    None
                };
                let size = parse_len(args[args.len() - 1])?;
                let payload = reader.read_payload(size)?.to_vec();
                consumed = raw.len() - reader.remaining();
                Card::File { uuid, src, payload }
            }
            "cfile" if args.len() == 3 || args.len() == 4 => {
                let uuid = parse_uuid(args[0])?;
                let src = if args.len() == 4 {
                    Some(parse_uuid(args[1])?)
                } else {
                    None
                };
                let usize_ = parse_len(args[args.len() - 2])?;
                let csize = parse_len(args[args.len() - 1])?;
                let compressed = reader.read_payload(csize)?;
                consumed = raw.len() - reader.remaining();
                let payload = body::decode(ContentType::Compressed, compressed)?;
                if payload.len() != usize_ {
                    return Err(SyncError::Protocol("cfile size mismatch".into()));
                }
                Card::CFile { uuid, src, payload }
            }
            "gimme" if args.len() == 1 => Card::Gimme(parse_uuid(args[0])?),
            "igot" if args.len() == 1 || args.len() == 2 => Card::IGot {
                uuid: parse_uuid(args[0])?,
                private: args.get(1) == Some(&"1"),
            },
            "private" if args.is_empty() => Card::Private,
            "reqconfig" if args.len() == 1 => Card::ReqConfig(args[0].into()),
            "config" if args.len() == 2 => {
                let size = parse_len(args[1])?;
                let payload = reader.read_payload(size)?.to_vec();
                consumed = raw.len() - reader.remaining();
                Card::Config {
                    name: args[0].into(),
                    payload,
                }
            }
            "cookie" if !args.is_empty() => Card::Cookie(args.join(" ")),
            "pragma" if !args.is_empty() => Card::Pragma(args.join(" ")),
            "clone_seqno" if args.len() == 1 => Card::CloneSeqno(parse_len(args[0])? as u64),
            "message" => Card::Message(args.join(" ")),
            "error" => Card::ErrorCard(args.join(" ")),
            other => {
                return Err(SyncError::Protocol(format!("unknown card {:?}", other)));
            }
        };
        cards.push(card);
    }
    Ok(cards)
}

// ---------------------------------------------------------------------------
// Message writer
// ---------------------------------------------------------------------------

/// Builds an outbound message under a byte cap.
struct MessageWriter {
    buf: Vec<u8>,
    cap: usize,
}

impl MessageWriter {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
        }
    }

    fn card(&mut self, line: &str) {
        self.buf.extend_from_slice(line.as_bytes());
        self.buf.push(b'\n');
    }

    fn payload(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.buf.push(b'\n');
    }

    fn at_cap(&self) -> bool {
        self.buf.len() >= self.cap
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Send policy
// ---------------------------------------------------------------------------

enum SendOutcome {
    Sent,
    Deferred,
    Skipped,
}

/// Emit the card(s) for one artifact, preferring a delta the peer can
/// apply, substituting an `igot` when the buffer is at cap.
fn send_artifact(
    repo: &Repository,
    writer: &mut MessageWriter,
    peer_has: &mut HashSet<ArtifactId>,
    rid: Rid,
    send_private: bool,
) -> Result<SendOutcome> {
    let private = repo.is_private(rid)?;
    if private && !send_private {
        return Ok(SendOutcome::Skipped);
    }
    let Some(uuid) = repo.uuid_of(rid)? else {
        return Ok(SendOutcome::Skipped);
    };
    if !repo.content_available(rid)? || peer_has.contains(&uuid) {
        return Ok(SendOutcome::Skipped);
    }
    if writer.at_cap() {
        writer.card(&format!("igot {}", uuid));
        return Ok(SendOutcome::Deferred);
    }

    let content = repo.get(rid)?;
    if private {
        writer.card("private");
    }
    if let Some(src) = repo.delta_source(rid)? {
        if let Some(src_uuid) = repo.uuid_of(src)? {
            // only delta against content the peer is known to hold
            if peer_has.contains(&src_uuid) {
                let base = repo.get(src)?;
                let delta_bytes = delta::compute(&base, &content);
                if Repository::delta_is_profitable(delta_bytes.len(), content.len()) {
                    writer.card(&format!("file {} {} {}", uuid, src_uuid, delta_bytes.len()));
                    writer.payload(&delta_bytes);
                    peer_has.insert(uuid);
                    repo.storage().remove_unsent(rid)?;
                    return Ok(SendOutcome::Sent);
                }
            }
        }
    }
    writer.card(&format!("file {} {}", uuid, content.len()));
    writer.payload(&content);
    peer_has.insert(uuid);
    repo.storage().remove_unsent(rid)?;
    Ok(SendOutcome::Sent)
}

// ---------------------------------------------------------------------------
// Shun-list config payloads
// ---------------------------------------------------------------------------

fn shun_config_payload(repo: &Repository) -> Result<Vec<u8>> {
    let mut out = String::new();
    for item in repo.storage().iter_shun() {
        let (uuid, record) = item?;
        out.push_str(&format!(
            "{} {} {}\n",
            uuid,
            record.mtime,
            escape_token(&record.scom)
        ));
    }
    Ok(out.into_bytes())
}

fn apply_shun_config(repo: &Repository, payload: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| SyncError::Protocol("bad shun config payload".into()))?;
    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        let uuid = parse_uuid(tokens[0])?;
        let comment = tokens
            .get(2)
            .and_then(|t| unescape_token(t).ok())
            .unwrap_or_default();
        if !repo.is_shunned(&uuid)? {
            repo.shun(uuid, &comment)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    caps: Capabilities,
    pulling: bool,
    pushing: bool,
    cloning: Option<(u32, u64)>,
    saw_gimme: bool,
    send_private: bool,
    private_pending: bool,
    peer_has: HashSet<ArtifactId>,
    to_send: VecDeque<Rid>,
    received: usize,
}

/// Handle one complete request message, producing the complete reply.
///
/// Never fails: protocol and content errors surface to the peer as
/// `error` cards and the remaining input is dropped.
pub fn handle_request(link: &Crosslinker, request: &[u8], ipaddr: &str) -> Vec<u8> {
    match serve_message(link, request, ipaddr) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(%err, "sync request failed");
            let mut writer = MessageWriter::new(MAX_DOWNLOAD);
            writer.card(&format!("error {}", err));
            writer.card(&format!("# timestamp {}", format_date(unix_now())));
            writer.into_bytes()
        }
    }
}

fn serve_message(link: &Crosslinker, request: &[u8], ipaddr: &str) -> Result<Vec<u8>> {
    let repo = link.repo();
    let cards = parse_message(request)?;
    let mut state = ServerState::default();
    let mut writer = MessageWriter::new(MAX_DOWNLOAD);
    let project_code = repo.project_code()?;
    let server_code = repo.server_code()?;

    // authorization pre-pass: the login card signs everything above it
    // and must take effect before any card it authorizes
    let mut login_ok = true;
    for card in &cards {
        if let Card::Login {
            user,
            nonce,
            sig,
            signed_len,
        } = card
        {
            let expected = request_nonce(&request[..*signed_len]);
            if expected != *nonce {
                login_ok = false;
                break;
            }
            match auth::verify_login(repo.storage(), &project_code, user, nonce, sig) {
                Ok(caps) => {
                    state.caps = caps;

                    repo.begin_receipt(user, ipaddr, nonce)?;
                }
                Err(AuthError::Storage(err)) => return Err(err.into()),
                Err(_) => {
                    login_ok = false;
                }
            }
            break;
        }
    }
    if !login_ok {
        writer.card("message login failed");
        // a cloning peer needs the codes to derive the right secret
        if cards
            .iter()
            .any(|c| matches!(c, Card::Clone { .. }))
        {
            writer.card(&format!("push {} {}", server_code, project_code));
        }
        writer.card(&format!("# timestamp {}", format_date(unix_now())));
        return Ok(writer.into_bytes());
    }

    link.crosslink_begin();
    let drained = drain_cards(link, &cards, &mut state, &mut writer, &project_code);
    let ended = link.crosslink_end();
    drained?;
    ended?;

    finish_reply(link, &mut state, &mut writer, &server_code, &project_code)?;
    writer.card(&format!("# timestamp {}", format_date(unix_now())));
    Ok(writer.into_bytes())
}

fn drain_cards(
    link: &Crosslinker,
    cards: &[Card],
    state: &mut ServerState,
    writer: &mut MessageWriter,
    project_code: &str,
) -> Result<()> {
    let repo = link.repo();
    for card in cards {
        match card {
            Card::Login { .. } | Card::Comment(_) => {}
            Card::Pull { project, .. } => {
                if project != project_code {
                    return Err(SyncError::Protocol("wrong project code".into()));
                }
                if !state.caps.read {
                    return Err(SyncError::Protocol("not authorized to read".into()));
                }
                state.pulling = true;
            }
            Card::Push { project, .. } => {
                if project != project_code {
                    return Err(SyncError::Protocol("wrong project code".into()));
                }
                if !state.caps.write {
                    return Err(SyncError::Protocol("not authorized to write".into()));
                }
                state.pushing = true;
            }
            Card::Clone { version, seqno } => {
                if !state.caps.clone {
                    return Err(SyncError::Protocol("not authorized to clone".into()));
                }
                state.cloning = Some((*version, *seqno));
            }
            Card::File { uuid, src, payload } | Card::CFile { uuid, src, payload } => {
                let private = std::mem::take(&mut state.private_pending);
                if !state.caps.write {
                    return Err(SyncError::Protocol("not authorized to write".into()));
                }
                if private && !state.caps.private {
                    // the artifact is dropped but the session continues
                    writer.card("error not authorized to sync private content");
                    continue;
                }
                receive_artifact(link, state, writer, *uuid, *src, payload, private)?;
            }
            Card::Gimme(uuid) => {
                state.saw_gimme = true;
                if !state.caps.read {
                    return Err(SyncError::Protocol("not authorized to read".into()));
                }
                if let Some(rid) = repo.storage().rid_for_uuid(uuid)? {
                    if repo.content_available(rid)? {
                        state.to_send.push_back(rid);
                    }
                }
            }
            Card::IGot { uuid, private } => {
                state.peer_has.insert(*uuid);
                if repo.storage().rid_for_uuid(uuid)?.is_none() {
                    let want_private = *private;
                    if !want_private || state.caps.private {
                        match repo.new_phantom(*uuid, want_private) {
                            Ok(_) => {}
                            Err(StoreError::ShunnedArtifact(_)) => {}
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
            }
            Card::Private => {
                state.private_pending = true;
            }
            Card::ReqConfig(name) => {
                if !state.caps.read {
                    return Err(SyncError::Protocol("not authorized to read".into()));
                }
                send_config(repo, writer, name)?;
            }
            Card::Config { name, payload } => {
                // legacy inbound path: accepted, never emitted unsolicited
                if name == "/shun" && state.caps.write {
                    apply_shun_config(repo, payload)?;
                }
            }
            Card::Cookie(text) => {
                repo.storage().put_meta("peer-cookie", text)?;
            }
            Card::Pragma(text) => {
                if text == "send-private" {
                    if state.caps.private {
                        state.send_private = true;
                    } else {
                        writer.card("error not authorized to sync private content");
                    }
                }
            }
            Card::CloneSeqno(_) | Card::Message(_) => {}
            Card::ErrorCard(text) => {
                return Err(SyncError::Remote(text.clone()));
            }
        }
    }
    Ok(())
}

fn receive_artifact(
    link: &Crosslinker,
    state: &mut ServerState,
    writer: &mut MessageWriter,
    uuid: ArtifactId,
    src: Option<ArtifactId>,
    payload: &[u8],
    private: bool,
) -> Result<()> {
    let repo = link.repo();
    let src_rid = match src {
        Some(src_uuid) => match repo.storage().rid_for_uuid(&src_uuid)? {
            Some(rid) if repo.content_available(rid)? => Some(rid),
            _ => {
                // we cannot apply this delta; ask for the base
                writer.card(&format!("gimme {}", src_uuid));
                return Ok(());
            }
        },
        None => None,
    };
    match repo.put(payload, Some(uuid), src_rid, private) {
        Ok(rid) => {
            link.crosslink(rid)?;
            state.peer_has.insert(uuid);
            state.received += 1;
            Ok(())
        }
        // shunned content is refused without ending the session
        Err(StoreError::ShunnedArtifact(_)) => Ok(()),
        Err(StoreError::PrivateDependency(_)) => {
            // the peer may re-send this artifact without the delta
            writer.card(&format!("message cannot accept delta {}", uuid));
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn send_config(repo: &Repository, writer: &mut MessageWriter, name: &str) -> Result<()> {
    let payload = match name {
        "/shun" => Some(shun_config_payload(repo)?),
        "content-schema" | "aux-schema" => repo
            .storage()
            .get_meta(name)?
            .map(|v| v.into_bytes()),
        _ => None,
    };
    match payload {
        Some(bytes) => {
            writer.card(&format!("config {} {}", name, bytes.len()));
            writer.payload(&bytes);
        }
        None => writer.card(&format!("message unknown config {}", name)),
    }
    Ok(())
}

fn finish_reply(
    link: &Crosslinker,
    state: &mut ServerState,
    writer: &mut MessageWriter,
    server_code: &str,
    project_code: &str,
) -> Result<()> {
    let repo = link.repo();

    // anything the peer asked for
    while let Some(rid) = state.to_send.pop_front() {
        send_artifact(repo, writer, &mut state.peer_has, rid, state.send_private)?;
    }

    if state.pushing {
        repo.form_clusters()?;
    }

    if state.pulling {
        // make sure the inventory the peer walks stays small
        repo.form_clusters()?;
        for rid in repo.iter_unclustered()? {
            let Some(uuid) = repo.uuid_of(rid)? else {
                continue;
            };
            if !repo.content_available(rid)? || state.peer_has.contains(&uuid) {
                continue;
            }
            if repo.is_private(rid)? {
                if state.send_private {
                    writer.card(&format!("igot {} 1", uuid));
                }
                continue;
            }
            writer.card(&format!("igot {}", uuid));
        }
    }

    if let Some((version, seqno)) = state.cloning {
        writer.card(&format!("push {} {}", server_code, project_code));
        if version >= 2 {
            stream_clone(repo, state, writer, seqno)?;
        } else if !state.saw_gimme {
            // first round of a legacy clone: advertise everything so the
            // peer can build its phantom set
            for item in repo.storage().iter_blobs() {
                let (rid, record) = item?;
                if record.is_phantom() || repo.is_private(rid)? {
                    continue;
                }
                writer.card(&format!("igot {}", record.uuid));
            }
        }
    }

    // ask for our own missing content
    let mut asked = 0;
    for rid in repo.iter_phantoms()? {
        if asked >= MAX_GIMME {
            break;
        }
        let Some(uuid) = repo.uuid_of(rid)? else {
            continue;
        };
        if repo.is_private(rid)? && !state.send_private {
            continue;
        }
        writer.card(&format!("gimme {}", uuid));
        asked += 1;
    }

    if state.received > 0 {
        debug!(received = state.received, "stored artifacts from peer");
    }
    Ok(())
}

/// Emit `cfile` cards in rid order until the reply is full, then the
/// resume point (0 = complete).
fn stream_clone(
    repo: &Repository,
    state: &mut ServerState,
    writer: &mut MessageWriter,
    seqno: u64,
) -> Result<()> {
    let mut next = 0u64;
    for item in repo.storage().iter_blobs() {
        let (rid, record) = item?;
        if (rid.0 as u64) < seqno {
            continue;
        }
        if writer.at_cap() {
            next = rid.0 as u64;
            break;
        }
        if record.is_phantom() || repo.is_private(rid)? {
            continue;
        }
        let raw = repo.storage().get_content(rid).map_err(StorageError::from)?;
        let Some(raw) = raw else { continue };
        // ship the stored form: deltas stay deltas when their base
        // already streamed, otherwise expand to full content
        let src_uuid = match repo.storage().delta_src(rid)? {
            Some(src)
                if (src.0 as u64) < (rid.0 as u64)
                    && !repo.is_private(src)?
                    && repo.content_available(src)? =>
            {
                repo.uuid_of(src)?
            }
            _ => None,
        };
        let (bytes, src_token) = match src_uuid {
            Some(src) => (raw, Some(src.to_hex())),
            None => (repo.get(rid)?, None),
        };
        let compressed = body::encode(ContentType::Compressed, &bytes)?;
        match src_token {
            Some(src) => writer.card(&format!(
                "cfile {} {} {} {}",
                record.uuid,
                src,
                bytes.len(),
                compressed.len()
            )),
            None => writer.card(&format!(
                "cfile {} {} {}",
                record.uuid,
                bytes.len(),
                compressed.len()
            )),
        }
        writer.payload(&compressed);
        state.peer_has.insert(record.uuid);
    }
    writer.card(&format!("clone_seqno {}", next));
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// What a client session should do.
#[derive(Clone, Debug)]
pub struct SyncOptions {
    pub pull: bool,
    pub push: bool,
    pub clone: bool,
    pub user: String,
    pub password: String,
    pub send_private: bool,
    /// Configuration names to request on the first round
    pub configs: Vec<String>,
    pub max_upload: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            pull: true,
            push: true,
            clone: false,
            user: "anonymous".into(),
            password: String::new(),
            send_private: false,
            configs: vec!["content-schema".into()],
            max_upload: MAX_UPLOAD,
        }
    }
}

impl SyncOptions {
    pub fn pull_only() -> Self {
        Self {
            push: false,
            ..Self::default()
        }
    }

    pub fn clone_repo() -> Self {
        Self {
            pull: false,
            push: false,
            clone: true,
            ..Self::default()
        }
    }
}

/// Outcome of one client session.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncOutcome {
    pub rounds: u32,
    pub sent: usize,
    pub received: usize,
}

/// Run a client sync session against a peer.
pub async fn sync_with<P: Peer>(
    link: &Crosslinker,
    peer: &mut P,
    options: &SyncOptions,
) -> Result<SyncOutcome> {
    let repo = link.repo().clone();
    let mut outcome = SyncOutcome::default();
    let mut peer_has: HashSet<ArtifactId> = HashSet::new();
    let mut to_send: VecDeque<Rid> = VecDeque::new();
    let mut login_failures = 0u32;
    let mut clone_seqno: Option<u64> = if options.clone { Some(1) } else { None };
    let mut clone_done = false;
    let mut configs_pending = options.configs.clone();
    let mut project_code = repo.project_code()?;
    let server_code = repo.server_code()?;

    loop {
        let mut writer = MessageWriter::new(options.max_upload);
        if options.clone {
            writer.card(&format!(
                "clone {} {}",
                CLONE_VERSION,
                clone_seqno.unwrap_or(1)
            ));
        } else {
            if options.pull {
                writer.card(&format!("pull {} {}", server_code, project_code));
            }
            if options.push {
                writer.card(&format!("push {} {}", server_code, project_code));
            }
        }
        if options.send_private {
            writer.card("pragma send-private");
        }
        if let Some(cookie) = repo.storage().get_meta("peer-cookie")? {
            writer.card(&format!("cookie {}", cookie));
        }

        // ask for what we are missing
        let mut asked = 0;
        for rid in repo.iter_phantoms()? {
            if asked >= MAX_GIMME {
                break;
            }
            let Some(uuid) = repo.uuid_of(rid)? else {
                continue;
            };
            if repo.is_private(rid)? && !options.send_private {
                continue;
            }
            writer.card(&format!("gimme {}", uuid));
            asked += 1;
        }

        if options.push {
            // answer the peer's requests from the previous round
            let mut deferred = VecDeque::new();
            while let Some(rid) = to_send.pop_front() {
                match send_artifact(&repo, &mut writer, &mut peer_has, rid, options.send_private)?
                {
                    SendOutcome::Sent => outcome.sent += 1,
                    SendOutcome::Deferred => deferred.push_back(rid),
                    SendOutcome::Skipped => {}
                }
            }
            to_send = deferred;

            // advertise inventory the peer may be missing
            let mut advertised: HashSet<Rid> = HashSet::new();
            for rid in repo
                .iter_unclustered()?
                .into_iter()
                .chain(repo.iter_unsent()?)
            {
                if !advertised.insert(rid) {
                    continue;
                }
                let Some(uuid) = repo.uuid_of(rid)? else {
                    continue;
                };
                if !repo.content_available(rid)? || peer_has.contains(&uuid) {
                    continue;
                }
                if repo.is_private(rid)? {
                    if options.send_private {
                        writer.card(&format!("igot {} 1", uuid));
                    }
                    continue;
                }
                writer.card(&format!("igot {}", uuid));
            }
        }

        for name in configs_pending.drain(..) {
            writer.card(&format!("reqconfig {}", name));
        }

        // a random comment inside the signed region keeps the nonce
        // unique even when two rounds carry identical cards
        writer.card(&format!("# {}", hex::encode(rand::random::<[u8; 16]>())));
        let nonce = request_nonce(&writer.buf);
        let secret = auth::client_secret(&project_code, &options.user, &options.password);
        let sig = login_signature(&nonce, &secret);
        writer.card(&format!("login {} {} {}", options.user, nonce, sig));

        let request = writer.into_bytes();
        let reply = peer.exchange(request).await?;
        outcome.rounds += 1;

        let phantoms_before = repo.iter_phantoms()?.len();
        let received_before = outcome.received;
        let mut login_failed_this_round = false;

        link.crosslink_begin();
        let drained = client_process_reply(
            link,
            &reply,
            options,
            &mut outcome,
            &mut peer_has,
            &mut to_send,
            &mut project_code,
            &mut clone_seqno,
            &mut clone_done,
            &mut login_failed_this_round,
        );
        let ended = link.crosslink_end();
        drained?;
        ended?;

        if login_failed_this_round {
            login_failures += 1;
            if login_failures > MAX_LOGIN_RETRIES {
                return Err(SyncError::LoginFailed);
            }
        }

        let phantoms_after = repo.iter_phantoms()?.len();
        let progress = outcome.received > received_before || phantoms_after != phantoms_before;
        let phantoms_remain = phantoms_after > 0;

        let keep_going = (phantoms_remain && progress)
            || !to_send.is_empty()
            || login_failed_this_round
            || (options.clone && !clone_done && outcome.rounds < 2)
            || clone_seqno.map(|n| n > 0).unwrap_or(false);
        if !keep_going || outcome.rounds >= MAX_ROUNDS {
            break;
        }
    }

    repo.flush()?;
    info!(
        rounds = outcome.rounds,
        sent = outcome.sent,
        received = outcome.received,
        "sync session complete"
    );
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn client_process_reply(
    link: &Crosslinker,
    reply: &[u8],
    options: &SyncOptions,
    outcome: &mut SyncOutcome,
    peer_has: &mut HashSet<ArtifactId>,
    to_send: &mut VecDeque<Rid>,
    project_code: &mut String,
    clone_seqno: &mut Option<u64>,
    clone_done: &mut bool,
    login_failed: &mut bool,
) -> Result<()> {
    let repo = link.repo();
    let cards = parse_message(reply)?;
    let mut private_pending = false;
    for card in &cards {
        match card {
            Card::File { uuid, src, payload } | Card::CFile { uuid, src, payload } => {
                let private = std::mem::take(&mut private_pending);
                let src_rid = match src {
                    Some(src_uuid) => match repo.storage().rid_for_uuid(src_uuid)? {
                        Some(rid) if repo.content_available(rid)? => Some(rid),
                        _ => {
                            debug!(uuid = %uuid, "skipping delta with unknown base");
                            continue;
                        }
                    },
                    None => None,
                };
                match repo.put(payload, Some(*uuid), src_rid, private) {
                    Ok(rid) => {
                        link.crosslink(rid)?;
                        peer_has.insert(*uuid);
                        outcome.received += 1;
                    }
                    Err(StoreError::ShunnedArtifact(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Card::IGot { uuid, private } => {
                peer_has.insert(*uuid);
                if repo.storage().rid_for_uuid(uuid)?.is_none() {
                    match repo.new_phantom(*uuid, *private) {
                        Ok(_) => {}
                        Err(StoreError::ShunnedArtifact(_)) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            Card::Gimme(uuid) => {
                if options.push {
                    if let Some(rid) = repo.storage().rid_for_uuid(uuid)? {
                        to_send.push_back(rid);
                    }
                }
            }
            Card::Push { project, .. } => {
                if options.clone && project_code.as_str() != project.as_str() {
                    repo.set_project_code(project)?;
                    *project_code = project.clone();
                }
            }
            Card::Config { name, payload } => match name.as_str() {
                "/shun" => apply_shun_config(repo, payload)?,
                "content-schema" => {
                    let remote = String::from_utf8_lossy(payload).into_owned();
                    let local = repo.storage().get_meta("content-schema")?.unwrap_or_default();
                    if options.clone {
                        repo.storage().put_meta("content-schema", &remote)?;
                    } else if remote != local {
                        return Err(SyncError::Protocol(format!(
                            "content schema mismatch: local {} remote {}",
                            local, remote
                        )));
                    }
                }
                "aux-schema" => {
                    // a local mismatch means rebuild, never refusal
                    let local = repo.storage().get_meta("aux-schema")?.unwrap_or_default();
                    if String::from_utf8_lossy(payload) != local {
                        link.rebuild()?;
                    }
                }
                _ => {}
            },
            Card::CloneSeqno(n) => {
                *clone_seqno = Some(*n);
                if *n == 0 {
                    *clone_done = true;
                }
            }
            Card::Private => {
                private_pending = true;
            }
            Card::Message(text) => {
                if text == "login failed" {
                    *login_failed = true;
                } else {
                    info!(server = %text, "server message");
                }
            }
            Card::ErrorCard(text) => {
                // the first round of a clone may fail login before the
                // project code is known; everything else is fatal
                if !(options.clone && outcome.rounds <= 1) {
                    return Err(SyncError::Remote(text.clone()));
                }
            }
            Card::Comment(text) => {
                if let Some(stamp) = text.strip_prefix("timestamp ") {
                    check_clock_skew(stamp, reply.len());
                }
            }
            Card::Cookie(text) => {
                repo.storage().put_meta("peer-cookie", text)?;
            }
            Card::Login { .. }
            | Card::Pull { .. }
            | Card::Clone { .. }
            | Card::ReqConfig(_)
            | Card::Pragma(_) => {}
        }
    }
    Ok(())
}

/// Warn when the server clock disagrees with ours beyond the tolerance;
/// bigger replies take longer to build, so they get more slack.
fn check_clock_skew(stamp: &str, reply_len: usize) {
    let Some(server_now) = parse_date(stamp) else {
        return;
    };
    let allowance = CLOCK_SKEW_WARN + reply_len as f64 / 50_000.0;
    let skew = (unix_now() - server_now).abs();
    if skew > allowance {
        warn!(skew, allowance, "peer clock disagrees with ours");
    }
}
