//! Test doubles for wiring nodes without a network.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use beacon_core::cluster::Announcement;
use beacon_core::error::{BeaconError, Result};

use crate::connector::ConnectorTransport;

/// What a scripted peer answers to one ping.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Reply(Announcement),
    Empty,
    Fail(String),
}

/// A connector transport answering from per-url scripts.
///
/// Queued responses are consumed first; afterwards the url's standing
/// response applies. Urls without either fail as unreachable.
#[derive(Default)]
pub struct ScriptedTransport {
    queued: Mutex<BTreeMap<String, VecDeque<ScriptedResponse>>>,
    standing: Mutex<BTreeMap<String, ScriptedResponse>>,
    requests: Mutex<Vec<(String, Announcement)>>,
}

impl ScriptedTransport {
    /// Create a transport without scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next ping to `url` with `response`.
    pub fn push(&self, url: impl Into<String>, response: ScriptedResponse) {
        if let Ok(mut queued) = self.queued.lock() {
            queued.entry(url.into()).or_default().push_back(response);
        }
    }

    /// Answer every ping to `url` with `response` once the queue is empty.
    pub fn respond_always(&self, url: impl Into<String>, response: ScriptedResponse) {
        if let Ok(mut standing) = self.standing.lock() {
            standing.insert(url.into(), response);
        }
    }

    /// Announcements sent to `url`, oldest first.
    pub fn requests_to(&self, url: &str) -> Vec<Announcement> {
        self.requests
            .lock()
            .map(|r| {
                r.iter()
                    .filter(|(u, _)| u == url)
                    .map(|(_, a)| a.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of pings sent so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    fn next_response(&self, url: &str) -> Option<ScriptedResponse> {
        let queued = self
            .queued
            .lock()
            .ok()
            .and_then(|mut q| q.get_mut(url).and_then(VecDeque::pop_front));
        queued.or_else(|| self.standing.lock().ok().and_then(|s| s.get(url).cloned()))
    }
}

#[async_trait]
impl ConnectorTransport for ScriptedTransport {
    async fn ping(&self, url: &str, announcement: &Announcement) -> Result<Option<Announcement>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((url.to_string(), announcement.clone()));
        }
        match self.next_response(url) {
            Some(ScriptedResponse::Reply(reply)) => Ok(Some(reply)),
            Some(ScriptedResponse::Empty) => Ok(None),
            Some(ScriptedResponse::Fail(message)) => Err(BeaconError::Connector(message)),
            None => Err(BeaconError::Connector(format!("{} is unreachable", url))),
        }
    }
}
