//! Scoped lamp control

use std::ops::{Deref, DerefMut};

use tracing::warn;

use super::adapter::ProtocolAdapter;
use crate::error::Result;

/// Holds the lamp on for a scope
///
/// Created by [`LampGuard::acquire`], which turns the lamp on. Call
/// [`LampGuard::release`] to turn it off and observe the result. If the
/// guard is dropped without release (early return, cancelled future) the
/// adapter turns the lamp off before its next command.
pub struct LampGuard<'a> {
    adapter: &'a mut ProtocolAdapter,
    released: bool,
}

impl<'a> LampGuard<'a> {
    /// Turn the lamp on
    ///
    /// On failure no guard is returned, but the adapter already holds a
    /// pending lamp-off since the device may have seen the write.
    pub async fn acquire(adapter: &'a mut ProtocolAdapter) -> Result<Self> {
        adapter.set_lamp(true).await?;
        Ok(Self {
            adapter,
            released: false,
        })
    }

    /// Turn the lamp off
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let result = self.adapter.set_lamp(false).await;
        if result.is_err() {
            self.adapter.lamp_off_pending = true;
        }
        result
    }
}

impl Deref for LampGuard<'_> {
    type Target = ProtocolAdapter;

    fn deref(&self) -> &ProtocolAdapter {
        self.adapter
    }
}

impl DerefMut for LampGuard<'_> {
    fn deref_mut(&mut self) -> &mut ProtocolAdapter {
        self.adapter
    }
}

impl Drop for LampGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!("Lamp guard dropped with lamp on, deferring lamp off");
            self.adapter.lamp_off_pending = true;
        }
    }
}
