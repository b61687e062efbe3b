//! Application port bindings
//!
//! Ports below [`EPHEMERAL_START`] are bound by apps; ports from it upward
//! are handed out as local ends of loops an app dials. Some low ports are
//! reserved for a named app and refuse any other binder.

use crate::app::frame::app_frame;
use crate::error::SetupError;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// First ephemeral port
pub const EPHEMERAL_START: u16 = 49152;

/// Channel the router uses to push frames to an app
pub type AppSender = mpsc::Sender<app_frame::Body>;

/// Default reserved port table
pub fn default_reserved_ports() -> HashMap<u16, String> {
    HashMap::from([
        (0, "router".to_string()),
        (1, "chat".to_string()),
        (2, "ssh".to_string()),
        (3, "socks".to_string()),
    ])
}

struct Binding {
    app: String,
    sender: AppSender,
}

struct PortState {
    bound: HashMap<u16, Binding>,
    // ephemeral port -> owning app port
    ephemeral: HashMap<u16, u16>,
    next_ephemeral: u16,
}

/// Port bindings of the local node
pub struct PortManager {
    reserved: HashMap<u16, String>,
    state: Mutex<PortState>,
}

impl PortManager {
    /// Create a manager with the given reserved table
    pub fn new(reserved: HashMap<u16, String>) -> Self {
        Self {
            reserved,
            state: Mutex::new(PortState {
                bound: HashMap::new(),
                ephemeral: HashMap::new(),
                next_ephemeral: EPHEMERAL_START,
            }),
        }
    }

    /// Bind `port` to `app`
    ///
    /// The checks and the insert happen under one lock.
    pub fn bind(&self, port: u16, app: &str, sender: AppSender) -> Result<(), SetupError> {
        if let Some(owner) = self.reserved.get(&port) {
            if owner != app {
                return Err(SetupError::ReservedPort(port));
            }
        }

        let mut state = self.state.lock();
        if state.bound.values().any(|b| b.app == app) {
            return Err(SetupError::AppAlreadyStarted(app.to_string()));
        }
        if state.bound.contains_key(&port) || state.ephemeral.contains_key(&port) {
            return Err(SetupError::PortAlreadyBound(port));
        }

        state.bound.insert(
            port,
            Binding {
                app: app.to_string(),
                sender,
            },
        );
        Ok(())
    }

    /// Release `port` and every ephemeral port it owns
    ///
    /// Returns the released ephemeral ports.
    pub fn unbind(&self, port: u16) -> Vec<u16> {
        let mut state = self.state.lock();
        state.bound.remove(&port);

        let owned: Vec<u16> = state
            .ephemeral
            .iter()
            .filter(|(_, owner)| **owner == port)
            .map(|(p, _)| *p)
            .collect();
        for p in &owned {
            state.ephemeral.remove(p);
        }
        owned
    }

    /// Reserve an ephemeral port on behalf of the app bound to `owner`
    pub fn alloc_ephemeral(&self, owner: u16) -> Result<u16, SetupError> {
        let mut state = self.state.lock();
        if !state.bound.contains_key(&owner) {
            return Err(SetupError::NoAppBound(owner));
        }

        let span = (u16::MAX - EPHEMERAL_START) as u32 + 1;
        for _ in 0..span {
            let candidate = state.next_ephemeral;
            state.next_ephemeral = if candidate == u16::MAX {
                EPHEMERAL_START
            } else {
                candidate + 1
            };

            if !state.bound.contains_key(&candidate) && !state.ephemeral.contains_key(&candidate) {
                state.ephemeral.insert(candidate, owner);
                return Ok(candidate);
            }
        }
        Err(SetupError::NoFreePorts)
    }

    /// Release an ephemeral port
    pub fn free_ephemeral(&self, port: u16) {
        self.state.lock().ephemeral.remove(&port);
    }

    /// App port responsible for `port` (itself, or the owner of an ephemeral)
    pub fn owner(&self, port: u16) -> Option<u16> {
        let state = self.state.lock();
        if state.bound.contains_key(&port) {
            return Some(port);
        }
        state.ephemeral.get(&port).copied()
    }

    /// Channel of the app responsible for `port`
    pub fn sender(&self, port: u16) -> Option<AppSender> {
        let state = self.state.lock();
        let owner = if state.bound.contains_key(&port) {
            port
        } else {
            *state.ephemeral.get(&port)?
        };
        state.bound.get(&owner).map(|b| b.sender.clone())
    }

    /// Whether an app is bound directly to `port`
    pub fn is_bound(&self, port: u16) -> bool {
        self.state.lock().bound.contains_key(&port)
    }

    /// Ports with a bound app
    pub fn bound_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.state.lock().bound.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}
