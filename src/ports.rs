//! # Listen port allocator for exporter processes.
//!
//! [`PortsRegistry`] hands out TCP ports from a fixed inclusive range.
//!
//! ## Rules
//! - A port is never loaned twice while reserved.
//! - Scanning starts one past the last issued port and wraps around, so a
//!   just-released port is reused only after the rest of the range was tried.
//! - Every candidate is checked by binding `127.0.0.1:port`, which skips ports
//!   taken by processes this registry does not know about.
//! - Release binds the port again; if something still listens on it the port
//!   stays reserved and [`PortsError::Busy`] is returned.
//!
//! ```text
//! range [65000, 65002]
//! reserve → 65000, reserve → 65001, release(65000), reserve → 65002,
//! reserve → 65000 (wrapped), reserve → NoFreePort
//! ```

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Mutex;

use crate::error::PortsError;

#[derive(Debug)]
struct State {
    last: Option<u16>,
    reserved: HashSet<u16>,
}

/// Thread-safe port allocator over `[min, max]`.
#[derive(Debug)]
pub struct PortsRegistry {
    min: u16,
    max: u16,
    state: Mutex<State>,
}

impl PortsRegistry {
    /// Creates a registry for `[min, max]` with `reserved` ports already taken.
    ///
    /// Pre-reserved ports outside the range are ignored.
    pub fn new(
        min: u16,
        max: u16,
        reserved: impl IntoIterator<Item = u16>,
    ) -> Result<Self, PortsError> {
        if min > max {
            return Err(PortsError::InvalidRange { min, max });
        }
        let reserved = reserved
            .into_iter()
            .filter(|p| (min..=max).contains(p))
            .collect();
        Ok(Self {
            min,
            max,
            state: Mutex::new(State {
                last: None,
                reserved,
            }),
        })
    }

    /// Reserves the next free port.
    pub fn reserve(&self) -> Result<u16, PortsError> {
        let mut state = self.lock();

        let size = u32::from(self.max) - u32::from(self.min) + 1;
        let start = match state.last {
            Some(last) => u32::from(last) - u32::from(self.min) + 1,
            None => 0,
        };

        for i in 0..size {
            let port = (u32::from(self.min) + (start + i) % size) as u16;
            if state.reserved.contains(&port) {
                continue;
            }
            if !is_bindable(port) {
                continue;
            }
            state.reserved.insert(port);
            state.last = Some(port);
            return Ok(port);
        }

        Err(PortsError::NoFreePort {
            min: self.min,
            max: self.max,
        })
    }

    /// Releases a reserved port.
    pub fn release(&self, port: u16) -> Result<(), PortsError> {
        let mut state = self.lock();

        if !state.reserved.contains(&port) {
            return Err(PortsError::NotReserved(port));
        }
        if !is_bindable(port) {
            return Err(PortsError::Busy(port));
        }
        state.reserved.remove(&port);
        Ok(())
    }

    /// Returns true if `port` is currently reserved.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().reserved.contains(&port)
    }

    /// Returns the number of reserved ports.
    pub fn reserved_count(&self) -> usize {
        self.lock().reserved.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Binds and immediately closes a listener on the loopback interface.
fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
