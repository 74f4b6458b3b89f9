//! Device lifecycle and control-plane bridge.
//!
//! [`DeviceController`] creates the virtual interface, binds the control
//! socket, brings the device up and then serves configuration transactions
//! until a termination source fires. Teardown always closes the control
//! socket before the device.

pub mod controller;
pub mod dispatcher;
pub mod termination;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::UapiError;
use crate::logging::SharedLogger;

pub use controller::DeviceController;
pub use termination::{ShutdownSignal, TerminationSignal};

/// A running VPN device that ingests configuration transactions
#[async_trait]
pub trait Device: Send + Sync + 'static {
    /// Apply a `key=value` configuration body
    async fn apply_config(&self, config: &str) -> Result<(), UapiError>;

    /// Mark the device operationally up
    async fn mark_up(&self) -> io::Result<()>;

    /// Serve one control connection to completion
    async fn handle_connection<C>(&self, conn: C)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Resolves once the device's internal workers have exited
    async fn wait(&self);

    /// Stop all workers and release the interface
    async fn close(&self);
}

/// Builds a device around a freshly created interface
pub trait DeviceFactory<T>: Send + Sync {
    type Device: Device;

    fn new_device(&self, interface: T, logger: SharedLogger) -> Self::Device;
}

/// Ownership wrapper that guarantees the device is closed at most once
pub struct DeviceHandle<D> {
    device: D,
    closed: AtomicBool,
}

impl<D: Device> DeviceHandle<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn apply_config(&self, config: &str) -> Result<(), UapiError> {
        self.device.apply_config(config).await
    }

    pub async fn mark_up(&self) -> io::Result<()> {
        self.device.mark_up().await
    }

    pub async fn handle_connection<C>(&self, conn: C)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.is_closed() {
            return;
        }
        self.device.handle_connection(conn).await
    }

    pub async fn wait(&self) {
        self.device.wait().await
    }

    /// Close the device; returns `false` if it was already closed
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.device.close().await;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Event, FakeDevice, Recorder};
    use super::*;

    #[tokio::test]
    async fn test_close_runs_once() {
        let recorder = Recorder::default();
        let handle = DeviceHandle::new(FakeDevice::new(recorder.clone()));

        assert!(handle.close().await);
        assert!(!handle.close().await);
        assert!(handle.is_closed());
        assert_eq!(recorder.count(&Event::DeviceClosed), 1);
    }

    #[tokio::test]
    async fn test_concurrent_close_runs_once() {
        let recorder = Recorder::default();
        let handle = std::sync::Arc::new(DeviceHandle::new(FakeDevice::new(recorder.clone())));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.close().await })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(recorder.count(&Event::DeviceClosed), 1);
    }
}
