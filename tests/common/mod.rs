//! In-memory remote note store for integration tests.
//!
//! Speaks the same protocol as the real server (`/notes/{id}/` and the
//! paged `/notes/` listing), and lets tests inject failures, inspect the
//! calls made, and check that requests for one note never overlap.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use sealnote::codec::{self, WireRecord};
use sealnote::{
    MasterKey, Method, NetworkError, Note, NoteId, Session, TransportClient, TransportResponse,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

pub const TOKEN: &str = "test-token";

pub fn key() -> MasterKey {
    MasterKey::from_bytes([7u8; 32])
}

pub fn other_key() -> MasterKey {
    MasterKey::from_bytes([9u8; 32])
}

pub fn session() -> Session {
    Session::new(TOKEN)
}

pub fn id(value: &str) -> NoteId {
    NoteId::new(value).unwrap()
}

/// A fixed point in time plus `secs` seconds.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// A note as another device would have pushed it.
pub fn sealed_note(
    note_id: &str,
    version: u64,
    secs: i64,
    content: &str,
    key: &MasterKey,
) -> Note {
    let mut note = Note::with_timestamp(id(note_id), version, at(secs), content);
    note.seal(key).unwrap();
    note
}

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Status(u16),
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: Method,
    pub path: String,
}

#[derive(Default)]
struct State {
    records: BTreeMap<String, WireRecord>,
    faults: VecDeque<Fault>,
    calls: Vec<Call>,
    in_flight: HashMap<String, usize>,
    in_flight_total: usize,
    max_parallel: usize,
    overlaps: usize,
}

pub struct FakeRemote {
    state: Mutex<State>,
    latency: Duration,
    conflict_body: bool,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            latency: Duration::ZERO,
            conflict_body: true,
        }
    }

    /// Every request takes this long, so overlapping requests actually overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answer 409 with an empty body, forcing the client to fetch the record.
    pub fn without_conflict_body(mut self) -> Self {
        self.conflict_body = false;
        self
    }

    pub fn insert(&self, note: &Note) {
        let record = codec::to_envelope(note).unwrap();
        self.state.lock().records.insert(record.id.clone(), record);
    }

    /// Store a record as is, without checking that it decodes.
    pub fn insert_record(&self, record: WireRecord) {
        self.state.lock().records.insert(record.id.clone(), record);
    }

    pub fn record(&self, note_id: &str) -> Option<WireRecord> {
        self.state.lock().records.get(note_id).cloned()
    }

    pub fn fail_next(&self, faults: impl IntoIterator<Item = Fault>) {
        self.state.lock().faults.extend(faults);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, method: Method) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Times a request started while another one for the same path was in flight.
    pub fn overlaps(&self) -> usize {
        self.state.lock().overlaps
    }

    pub fn max_parallel(&self) -> usize {
        self.state.lock().max_parallel
    }

    fn begin(&self, method: Method, path: &str) {
        let mut state = self.state.lock();
        state.calls.push(Call {
            method,
            path: path.to_string(),
        });
        let count = state.in_flight.entry(path.to_string()).or_insert(0);
        *count += 1;
        if *count > 1 {
            state.overlaps += 1;
        }
        state.in_flight_total += 1;
        state.max_parallel = state.max_parallel.max(state.in_flight_total);
    }

    fn end(&self, path: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.in_flight.get_mut(path) {
            *count -= 1;
        }
        state.in_flight_total -= 1;
    }

    fn handle(
        &self,
        method: Method,
        path: &str,
        session: &Session,
        body: Option<&[u8]>,
    ) -> Result<TransportResponse, NetworkError> {
        let mut state = self.state.lock();
        match state.faults.pop_front() {
            Some(Fault::Network) => return Err(NetworkError::new("connection reset")),
            Some(Fault::Status(status)) => return Ok(TransportResponse::new(status, Vec::new())),
            None => {}
        }
        if session.token() != TOKEN {
            return Ok(TransportResponse::new(401, Vec::new()));
        }

        let rest = path
            .strip_prefix("/notes/")
            .ok_or_else(|| NetworkError::new(format!("unexpected path {}", path)))?;

        if let Some(query) = rest.strip_prefix('?') {
            let (skip, limit) = parse_listing(query);
            let page: Vec<&WireRecord> = state.records.values().skip(skip).take(limit).collect();
            return Ok(TransportResponse::new(200, serde_json::to_vec(&page).unwrap()));
        }

        let note_id = rest.trim_end_matches('/').to_string();
        match method {
            Method::Get => Ok(match state.records.get(&note_id) {
                Some(record) => TransportResponse::new(200, serde_json::to_vec(record).unwrap()),
                None => TransportResponse::new(404, Vec::new()),
            }),
            Method::Put => {
                let record: WireRecord = match body.map(serde_json::from_slice) {
                    Some(Ok(record)) => record,
                    _ => return Ok(TransportResponse::new(400, Vec::new())),
                };
                let newer_or_equal = state
                    .records
                    .get(&note_id)
                    .filter(|existing| existing.version >= record.version);
                if let Some(existing) = newer_or_equal {
                    let body = if self.conflict_body {
                        serde_json::to_vec(existing).unwrap()
                    } else {
                        Vec::new()
                    };
                    return Ok(TransportResponse::new(409, body));
                }
                let echo = serde_json::to_vec(&record).unwrap();
                state.records.insert(note_id, record);
                Ok(TransportResponse::new(200, echo))
            }
            Method::Delete => Ok(match state.records.remove(&note_id) {
                Some(_) => TransportResponse::new(204, Vec::new()),
                None => TransportResponse::new(404, Vec::new()),
            }),
        }
    }
}

#[async_trait]
impl TransportClient for FakeRemote {
    async fn send(
        &self,
        method: Method,
        path: &str,
        session: &Session,
        body: Option<&[u8]>,
    ) -> Result<TransportResponse, NetworkError> {
        self.begin(method, path);
        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }
        let response = self.handle(method, path, session, body);
        self.end(path);
        response
    }
}

fn parse_listing(query: &str) -> (usize, usize) {
    let mut skip = 0;
    let mut limit = usize::MAX;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("skip", value)) => skip = value.parse().unwrap(),
            Some(("limit", value)) => limit = value.parse().unwrap(),
            _ => {}
        }
    }
    (skip, limit)
}
