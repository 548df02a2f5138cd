//! ACL send-credit accounting.
//!
//! The proxy reserves a fixed share of the controller's ACL buffers per
//! transport when the host's (LE_)Read_Buffer_Size command completes. A
//! [`SendCredit`] is permission to have one ACL packet in flight; credits are
//! consumed on send, tracked against the connection that used them, and
//! returned when the controller reports the packet completed.

use crate::config::MAX_ACL_CONNECTIONS;
use crate::types::Transport;
use crate::Error;

/// Permission to send one ACL packet on `transport`.
///
/// Move-only. Consumed by a send, or explicitly handed back with
/// [`AclDataChannel::give_back`] if the reservation went unused.
#[must_use]
pub(crate) struct SendCredit {
    transport: Transport,
}

#[derive(Clone, Copy)]
struct ConnectionCredits {
    handle: u16,
    used: u16,
}

struct TransportState {
    /// How many credits the proxy wants; fixed at construction.
    desired: u16,
    /// Set once, by the first qualifying buffer-size response.
    reserved: Option<u16>,
    available: u16,
    in_flight: [Option<ConnectionCredits>; MAX_ACL_CONNECTIONS],
}

impl TransportState {
    const fn new(desired: u16) -> Self {
        Self {
            desired,
            reserved: None,
            available: 0,
            in_flight: [None; MAX_ACL_CONNECTIONS],
        }
    }

    fn reserve(&mut self, controller_total: u16) -> Option<u16> {
        if self.reserved.is_some() {
            // Already initialized; later responses are passed through without
            // re-reserving to avoid double counting.
            return None;
        }
        let reserved = self.desired.min(controller_total);
        self.reserved = Some(reserved);
        self.available = reserved;
        Some(reserved)
    }

    fn record_send(&mut self, handle: u16) -> Result<(), Error> {
        for entry in self.in_flight.iter_mut().flatten() {
            if entry.handle == handle {
                entry.used += 1;
                return Ok(());
            }
        }
        for slot in self.in_flight.iter_mut() {
            if slot.is_none() {
                *slot = Some(ConnectionCredits { handle, used: 1 });
                return Ok(());
            }
        }
        warn!("[acl] no connection slot left to track credits for {:02x}", handle);
        Err(Error::Unavailable)
    }

    /// Reclaim up to `reported` credits used on `handle`. Returns how many
    /// were actually reclaimed; never more than what this transport has in
    /// flight on that connection.
    fn reclaim(&mut self, handle: u16, reported: u16) -> u16 {
        for slot in self.in_flight.iter_mut() {
            if let Some(entry) = slot {
                if entry.handle == handle {
                    let reclaimed = entry.used.min(reported);
                    entry.used -= reclaimed;
                    self.available += reclaimed;
                    if entry.used == 0 {
                        *slot = None;
                    }
                    return reclaimed;
                }
            }
        }
        0
    }

    /// The controller flushes a disconnected link's packets without reporting
    /// them completed, so take those credits back directly.
    fn process_disconnect(&mut self, handle: u16) {
        for slot in self.in_flight.iter_mut() {
            if let Some(entry) = slot {
                if entry.handle == handle {
                    self.available += entry.used;
                    *slot = None;
                    return;
                }
            }
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.desired);
    }
}

/// Per-transport credit manager shared by every channel the proxy runs.
pub(crate) struct AclDataChannel {
    le: TransportState,
    bredr: TransportState,
}

impl AclDataChannel {
    pub const fn new(le_credits_to_reserve: u16, bredr_credits_to_reserve: u16) -> Self {
        Self {
            le: TransportState::new(le_credits_to_reserve),
            bredr: TransportState::new(bredr_credits_to_reserve),
        }
    }

    fn transport(&self, transport: Transport) -> &TransportState {
        match transport {
            Transport::Le => &self.le,
            Transport::BrEdr => &self.bredr,
        }
    }

    fn transport_mut(&mut self, transport: Transport) -> &mut TransportState {
        match transport {
            Transport::Le => &mut self.le,
            Transport::BrEdr => &mut self.bredr,
        }
    }

    /// Whether the proxy intends to send on `transport`. True as soon as a
    /// nonzero reservation was requested, even before (or without) the
    /// controller granting any credits.
    pub fn has_send_capability(&self, transport: Transport) -> bool {
        self.transport(transport).desired > 0
    }

    pub fn free_credits(&self, transport: Transport) -> u16 {
        self.transport(transport).available
    }

    /// Handle a buffer-size report of `controller_total` packets. Returns the
    /// number of credits carved out for the proxy, to be subtracted from the
    /// response before it continues on to the host. Only the first qualifying
    /// report per transport is honored; later ones return `None`.
    pub fn reserve_credits(&mut self, transport: Transport, controller_total: u16) -> Option<u16> {
        let reserved = self.transport_mut(transport).reserve(controller_total);
        if let Some(reserved) = reserved {
            info!("[acl] reserved {} of {} credits", reserved, controller_total);
        }
        reserved
    }

    pub fn reserve_send_credit(&mut self, transport: Transport) -> Option<SendCredit> {
        let state = self.transport_mut(transport);
        if state.available > 0 {
            state.available -= 1;
            Some(SendCredit { transport })
        } else {
            None
        }
    }

    /// Return an unused credit to the pool.
    pub fn give_back(&mut self, credit: SendCredit) {
        self.transport_mut(credit.transport).available += 1;
    }

    /// Consume `credit` for a send on `handle`, moving it into the in-flight
    /// count for that connection. Fails only if the connection table is full,
    /// in which case the credit is returned to the pool.
    pub fn record_send(&mut self, credit: SendCredit, handle: u16) -> Result<(), Error> {
        let transport = credit.transport;
        match self.transport_mut(transport).record_send(handle) {
            Ok(()) => {
                // The credit is now represented by the in-flight count.
                core::mem::forget(credit);
                Ok(())
            }
            Err(e) => {
                self.give_back(credit);
                Err(e)
            }
        }
    }

    /// Reclaim completions reported for `handle`, whichever transport it is
    /// on. Returns the amount reclaimed for the proxy; the caller deducts it
    /// from the event before forwarding.
    pub fn reclaim(&mut self, handle: u16, reported: u16) -> u16 {
        let reclaimed = self.le.reclaim(handle, reported);
        if reclaimed > 0 {
            return reclaimed;
        }
        self.bredr.reclaim(handle, reported)
    }

    pub fn process_disconnect(&mut self, handle: u16) {
        self.le.process_disconnect(handle);
        self.bredr.process_disconnect(handle);
    }

    pub fn reset(&mut self) {
        self.le.reset();
        self.bredr.reset();
    }
}
