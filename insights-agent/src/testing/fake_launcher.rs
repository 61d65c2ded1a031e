// ABOUTME: ProcessLauncher that hands out FakePeers instead of spawning binaries.
// ABOUTME: Records every ProcessSpec so tests can assert on argv and environment.

use crate::error::ProcessError;
use crate::testing::fake_peer::FakePeer;
use crate::transport::{LaunchedProcess, ProcessLauncher, ProcessSpec};
use std::sync::Mutex;

type Setup = Box<dyn Fn(&FakePeer) + Send + Sync>;

pub struct FakeLauncher {
    setup: Setup,
    failure: Option<String>,
    peers: Mutex<Vec<FakePeer>>,
    specs: Mutex<Vec<ProcessSpec>>,
}

impl FakeLauncher {
    /// Every launched peer is configured by `setup` before the backend sees it
    pub fn new<F>(setup: F) -> Self
    where
        F: Fn(&FakePeer) + Send + Sync + 'static,
    {
        Self {
            setup: Box::new(setup),
            failure: None,
            peers: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
        }
    }

    /// A launcher whose every launch fails
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new(|_| {})
        }
    }

    pub fn peers(&self) -> Vec<FakePeer> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn peer(&self, index: usize) -> Option<FakePeer> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(index)
            .cloned()
    }

    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.specs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn launch_count(&self) -> usize {
        self.specs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<LaunchedProcess, ProcessError> {
        self.specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());
        if let Some(message) = &self.failure {
            return Err(ProcessError::new(message.clone()));
        }
        let (peer, launched) = FakePeer::new();
        (self.setup)(&peer);
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(peer);
        Ok(launched)
    }
}
