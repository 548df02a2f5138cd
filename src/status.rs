//! Connection status notifications for L2CAP services.

use core::cell::RefCell;

use bt_hci::param::ConnHandle;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::config::MAX_STATUS_DELEGATES;
use crate::Error;

/// Details of a connection-oriented channel the proxy has opened.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct L2capConnectionInfo {
    pub psm: u16,
    pub connection_handle: ConnHandle,
    pub local_cid: u16,
    pub remote_cid: u16,
}

/// Observer of L2CAP connection lifecycle for one service, identified by PSM.
///
/// Registered delegates must outlive the proxy and must not call back into it.
pub trait L2capStatusDelegate {
    /// The PSM this delegate wants open notifications for.
    fn psm(&self) -> u16;
    /// A connection-oriented channel on the delegate's PSM was opened.
    fn connection_opened(&mut self, info: &L2capConnectionInfo);
    /// The ACL connection went down, tearing down every channel on it.
    fn connection_closed(&mut self, connection_handle: ConnHandle);
}

pub(crate) struct StatusTracker<'d, M: RawMutex> {
    delegates: Mutex<M, RefCell<heapless::Vec<&'d mut dyn L2capStatusDelegate, MAX_STATUS_DELEGATES>>>,
}

impl<'d, M: RawMutex> StatusTracker<'d, M> {
    pub fn new() -> Self {
        Self {
            delegates: Mutex::new(RefCell::new(heapless::Vec::new())),
        }
    }

    pub fn register(&self, delegate: &'d mut dyn L2capStatusDelegate) -> Result<(), Error> {
        self.delegates.lock(|delegates| {
            delegates
                .borrow_mut()
                .push(delegate)
                .map_err(|_| Error::Unavailable)
        })
    }

    pub fn unregister(&self, delegate: &dyn L2capStatusDelegate) -> Result<(), Error> {
        self.delegates.lock(|delegates| {
            let mut delegates = delegates.borrow_mut();
            let target = delegate as *const dyn L2capStatusDelegate as *const ();
            for index in 0..delegates.len() {
                let registered = (&*delegates[index]) as *const dyn L2capStatusDelegate as *const ();
                if registered == target {
                    delegates.swap_remove(index);
                    return Ok(());
                }
            }
            Err(Error::NotFound)
        })
    }

    pub fn notify_opened(&self, info: &L2capConnectionInfo) {
        self.delegates.lock(|delegates| {
            for delegate in delegates.borrow_mut().iter_mut() {
                if delegate.psm() == info.psm {
                    delegate.connection_opened(info);
                }
            }
        });
    }

    pub fn notify_closed(&self, connection_handle: ConnHandle) {
        self.delegates.lock(|delegates| {
            for delegate in delegates.borrow_mut().iter_mut() {
                delegate.connection_closed(connection_handle);
            }
        });
    }
}
