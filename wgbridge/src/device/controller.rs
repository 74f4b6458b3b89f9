use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::config::DeviceConfig;
use crate::device::dispatcher;
use crate::device::termination::{wait_for_termination, OsSignals, ShutdownSignal};
use crate::device::{DeviceFactory, DeviceHandle};
use crate::error::DeviceError;
use crate::logging::{self, SharedLogger};
use crate::platform::{ControlListener, ControlSocketProvider, InterfaceProvider, VirtualInterface};
use crate::{log_error, log_verbose};

/// Owns the lifecycle of one device: interface, control socket and run loop
pub struct DeviceController<I, S, F> {
    interfaces: I,
    sockets: S,
    devices: F,
}

impl<I, S, F> DeviceController<I, S, F>
where
    I: InterfaceProvider,
    S: ControlSocketProvider,
    F: DeviceFactory<I::Interface>,
{
    pub fn new(interfaces: I, sockets: S, devices: F) -> Self {
        Self {
            interfaces,
            sockets,
            devices,
        }
    }

    /// Run the device until SIGTERM/SIGINT, a control socket failure, or the
    /// device stopping by itself.
    pub async fn start(&self, config: &mut DeviceConfig) -> Result<(), DeviceError> {
        let signals = OsSignals::subscribe().map_err(DeviceError::SignalSetupFailed)?;
        self.run_until(config, signals.recv()).await
    }

    /// Run the device until `shutdown` resolves or another termination
    /// source fires.
    pub async fn run_until<Sh>(
        &self,
        config: &mut DeviceConfig,
        shutdown: Sh,
    ) -> Result<(), DeviceError>
    where
        Sh: Future<Output = ShutdownSignal>,
    {
        let logger = logging::device_logger(&config.logger_settings, &config.interface_name);

        config.mtu = config.effective_mtu();
        let interface = self
            .interfaces
            .create(&config.interface_name, config.mtu)
            .await
            .map_err(|e| {
                log_error!(logger, "Failed to create TUN device: {}", e);
                DeviceError::InterfaceCreationFailed(e)
            })?;

        match interface.name() {
            Ok(name) => config.interface_name = name,
            Err(e) => log_error!(logger, "Failed to read back interface name: {}", e),
        }
        let name = config.interface_name.clone();

        // The interface is released on drop if this fails.
        let socket = self.sockets.open(&name).map_err(|e| {
            log_error!(logger, "UAPI listen error: {}", e);
            DeviceError::ControlSocketOpenFailed(e)
        })?;

        log_verbose!(
            logger,
            "Starting {} device {} (version {}, mtu {})",
            config.flavor,
            name,
            env!("CARGO_PKG_VERSION"),
            config.mtu
        );

        let device = Arc::new(DeviceHandle::new(
            self.devices.new_device(interface, logger.clone()),
        ));

        if let Some(initial) = config.flavor.initial_config() {
            if let Err(e) = device.apply_config(&initial).await {
                log_error!(logger, "Failed to apply initial configuration: {}", e);
                device.close().await;
                return Err(DeviceError::InitialConfigFailed(e));
            }
        }

        if let Err(e) = device.mark_up().await {
            log_error!(logger, "Failed to bring device up: {}", e);
            device.close().await;
            return Err(DeviceError::MarkUpFailed(e));
        }

        let listener = match self.sockets.listen(&name, socket) {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                log_error!(logger, "Failed to listen on uapi socket: {}", e);
                device.close().await;
                return Err(DeviceError::ControlSocketListenFailed(e));
            }
        };

        let (errors_tx, errors_rx) = oneshot::channel();
        let accept_loop =
            dispatcher::spawn(listener.clone(), device.clone(), errors_tx, logger.clone());

        log_verbose!(logger, "UAPI listener started");

        let cause = wait_for_termination(shutdown, errors_rx, device.wait()).await;
        log_verbose!(logger, "Stopping: {}", cause);

        teardown(&*listener, accept_loop, &device, &logger).await;

        Ok(())
    }
}

/// Close the control socket, let the accept loop drain, then close the device
async fn teardown<L, D>(
    listener: &L,
    accept_loop: tokio::task::JoinHandle<()>,
    device: &DeviceHandle<D>,
    logger: &SharedLogger,
) where
    L: ControlListener,
    D: crate::device::Device,
{
    listener.close();
    if let Err(e) = accept_loop.await {
        log_error!(logger, "UAPI accept loop ended abnormally: {}", e);
    }
    device.close().await;

    log_verbose!(logger, "Shutting down");
}
