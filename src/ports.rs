//! Loopback port reservation.
//!
//! Ports are reserved by binding listeners on `127.0.0.1:0` and holding them
//! open, so no other reservation in the same test run can receive the same
//! port. Once the owner is ready to hand the ports to another process it calls
//! [`Ports::free`], which closes every listener at once.

use std::collections::VecDeque;
use std::net::TcpListener;

use crate::error::{HarnessError, Result};

#[derive(Debug)]
pub struct Ports {
    listeners: Vec<TcpListener>,
    unclaimed: VecDeque<u16>,
}

impl Ports {
    /// Reserve `count` distinct free ports.
    pub fn reserve(count: usize) -> Result<Self> {
        let mut listeners = Vec::with_capacity(count);
        let mut unclaimed = VecDeque::with_capacity(count);

        for _ in 0..count {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            unclaimed.push_back(listener.local_addr()?.port());
            listeners.push(listener);
        }

        tracing::debug!(ports = ?unclaimed, "Reserved ports");

        Ok(Self {
            listeners,
            unclaimed,
        })
    }

    /// Claim the next reserved port. Each port is handed out once.
    pub fn port(&mut self) -> Result<u16> {
        self.unclaimed
            .pop_front()
            .ok_or_else(|| HarnessError::Config("all reserved ports already claimed".to_string()))
    }

    /// Release every reservation so another process can bind the ports.
    pub fn free(&mut self) {
        if !self.listeners.is_empty() {
            tracing::debug!(count = self.listeners.len(), "Releasing reserved ports");
        }
        self.listeners.clear();
    }

    pub fn is_reserved(&self) -> bool {
        !self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn reserve_hands_out_distinct_ports() {
        let mut ports = Ports::reserve(5).unwrap();
        let claimed: HashSet<u16> = (0..5).map(|_| ports.port().unwrap()).collect();
        assert_eq!(claimed.len(), 5);
    }

    #[test]
    fn claiming_past_reservation_fails() {
        let mut ports = Ports::reserve(1).unwrap();
        ports.port().unwrap();
        assert!(matches!(ports.port(), Err(HarnessError::Config(_))));
    }

    #[test]
    fn reserved_ports_cannot_be_bound_until_freed() {
        let mut ports = Ports::reserve(1).unwrap();
        let port = ports.port().unwrap();

        assert!(TcpListener::bind(("127.0.0.1", port)).is_err());

        ports.free();
        assert!(!ports.is_reserved());
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn free_is_idempotent() {
        let mut ports = Ports::reserve(2).unwrap();
        ports.free();
        ports.free();
        assert!(!ports.is_reserved());
    }
}
