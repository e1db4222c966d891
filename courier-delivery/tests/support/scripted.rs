//! Scripted providers for driving the orchestrator through known failure patterns
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::time::Duration;

use async_trait::async_trait;
use courier_delivery::{Ack, Message, Provider, ProviderError};
use parking_lot::Mutex;
use tokio::time::Instant;

/// How a [`ScriptedProvider`] answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Accept every message
    Succeed,
    /// Fail every attempt with a temporary error
    Fail,
    /// Fail the first `n` attempts, then accept
    FailTimes(u32),
    /// Permanently reject every message
    Reject,
}

/// Provider whose behaviour is fixed up front and which records every call
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    script: Mutex<Script>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, script: Script) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sleep for `delay` inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    /// Number of `attempt_delivery` calls so far
    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// When each call started
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt_delivery(&self, message: &Message) -> Result<Ack, ProviderError> {
        let attempt = {
            let mut calls = self.calls.lock();
            calls.push(Instant::now());
            calls.len()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let script = *self.script.lock();
        match script {
            Script::Succeed => Ok(Ack::new(format!("{} accepted {}", self.name, message.id()))),
            Script::FailTimes(n) if attempt > n as usize => {
                Ok(Ack::new(format!("{} accepted {}", self.name, message.id())))
            }
            Script::Fail | Script::FailTimes(_) => Err(ProviderError::Temporary(format!(
                "{} failed to send email.",
                self.name
            ))),
            Script::Reject => Err(ProviderError::Permanent(format!(
                "{} rejected {}",
                self.name,
                message.recipient()
            ))),
        }
    }
}
