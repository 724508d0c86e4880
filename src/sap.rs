//! The SAP table: 16 service access points, each bound to at most one client.
//!
//! Bindings are sparse events but deliveries are frequent, so operations hold
//! the lock only long enough to read or update a slot; the delivery sender is
//! cloned out and used after release.

use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

pub const NUM_SAPS: usize = 16;

/// Bytes of an already-encoded SIS PDU pushed at a bound client connection.
pub type DeliverySender = UnboundedSender<Vec<u8>>;

#[derive(Clone)]
pub struct SapBinding {
    pub conn_id: u64,
    pub rank: u8,
    pub service_type: u16,
    pub deliver: DeliverySender,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BindError {
    Occupied,
}

pub struct SapTable {
    slots: Mutex<[Option<SapBinding>; NUM_SAPS]>,
}

impl Default for SapTable {
    fn default() -> Self {
        SapTable {
            slots: Mutex::new(std::array::from_fn(|_| None)),
        }
    }
}

impl SapTable {
    /// Atomically claim a SAP for a connection. At most one live connection
    /// owns a SAP at any instant.
    pub fn bind(&self, sap: u8, binding: SapBinding) -> Result<(), BindError> {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[sap as usize];
        if slot.is_some() {
            return Err(BindError::Occupied);
        }
        debug!("sap {} bound by connection {}", sap, binding.conn_id);
        *slot = Some(binding);
        Ok(())
    }

    /// Release a SAP, but only if this connection still owns it.
    pub fn unbind(&self, sap: u8, conn_id: u64) -> bool {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[sap as usize];
        match slot {
            Some(binding) if binding.conn_id == conn_id => {
                debug!("sap {} released by connection {}", sap, conn_id);
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Release every SAP owned by a closing connection.
    pub fn unbind_all(&self, conn_id: u64) {
        let mut slots = self.slots.lock().unwrap();
        for (sap, slot) in slots.iter_mut().enumerate() {
            if matches!(slot, Some(b) if b.conn_id == conn_id) {
                debug!("sap {} released by closing connection {}", sap, conn_id);
                *slot = None;
            }
        }
    }

    /// Delivery handle of the connection bound to `sap`, if any.
    pub fn lookup(&self, sap: u8) -> Option<DeliverySender> {
        let slots = self.slots.lock().unwrap();
        slots[sap as usize].as_ref().map(|b| b.deliver.clone())
    }

    pub fn is_bound(&self, sap: u8) -> bool {
        self.slots.lock().unwrap()[sap as usize].is_some()
    }

    /// Release every binding, returning the delivery handles so the daemon
    /// can push UNBIND_INDICATIONs at shutdown.
    pub fn drain(&self) -> Vec<DeliverySender> {
        let mut slots = self.slots.lock().unwrap();
        slots
            .iter_mut()
            .filter_map(|slot| slot.take().map(|b| b.deliver))
            .collect()
    }
}
