//! Shared test doubles for the transport seam.

use crate::cdp::client::{CDPError, EventCallback, Result as CdpResult, Transport};
use crate::cdp::protocol::CDPEvent;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// A transport that records every command, serves canned results, and
/// lets tests fire protocol events at registered callbacks.
pub(crate) struct RecordingTransport {
    calls: Mutex<Vec<(String, Option<Value>, Option<String>)>>,
    results: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashSet<String>>,
    callbacks: Mutex<HashMap<String, Vec<EventCallback>>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            results: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            callbacks: Mutex::new(HashMap::new()),
        })
    }

    /// Canned result for a method (default is Null).
    pub fn set_result(&self, method: &str, value: Value) {
        self.results.lock().unwrap().insert(method.to_string(), value);
    }

    /// Make a method fail with a generic protocol error.
    pub fn fail_method(&self, method: &str) {
        self.failing.lock().unwrap().insert(method.to_string());
    }

    /// Deliver a protocol event to every callback registered for it.
    pub fn emit(&self, method: &str, params: Value, session_id: Option<&str>) {
        let callbacks: Vec<EventCallback> = self
            .callbacks
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .unwrap_or_default();
        for callback in callbacks {
            callback(CDPEvent {
                method: method.to_string(),
                params: Some(params.clone()),
                session_id: session_id.map(String::from),
            });
        }
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _, s)| (m.clone(), s.clone()))
            .collect()
    }

    pub fn params_of(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _, _)| m == method)
            .filter_map(|(_, p, _)| p.clone())
            .collect()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _, _)| m == method)
            .count()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> CdpResult<Value> {
        self.calls.lock().unwrap().push((
            method.to_string(),
            params,
            session_id.map(String::from),
        ));

        if self.failing.lock().unwrap().contains(method) {
            return Err(CDPError::Protocol {
                code: -32000,
                message: format!("{method} failed"),
            });
        }

        Ok(self
            .results
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn on_event(&self, method: &str, callback: EventCallback) {
        self.callbacks
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push(callback);
    }
}
