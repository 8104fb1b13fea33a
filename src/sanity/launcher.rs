//! Run a CSI plugin in the background for the duration of a sanity run

use anyhow::{anyhow, Context};
use grpcio::Server;
use log::{debug, error, info};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::super::driver::{remove_socket_file, socket_path, Driver, DriverOptions};

/// The max time to wait for a launched plugin to start listening
pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);
/// The name of the thread owning the plugin server
const SERVING_THREAD_NAME: &str = "csi-plugin";

/// A plugin serving in the background, stopped on `stop` or drop
#[derive(Debug)]
pub struct PluginHandle {
    /// The end point the plugin listens on
    end_point: String,
    /// Asks the serving thread to shut the server down
    shutdown_tx: Option<Sender<()>>,
    /// The thread owning the server
    serving_thread: Option<JoinHandle<anyhow::Result<()>>>,
}

impl PluginHandle {
    /// The end point the plugin listens on
    pub fn end_point(&self) -> &str {
        &self.end_point
    }

    /// Shut the plugin down and remove its socket file
    pub fn stop(mut self) -> anyhow::Result<()> {
        self.shutdown()
    }

    /// Signal the serving thread and wait for it to finish
    fn shutdown(&mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            // The serving thread may have exited already
            let _ = tx.send(());
        }
        match self.serving_thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("the serving thread of {} panicked", self.end_point))?,
            None => Ok(()),
        }
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(
                "failed to stop plugin on {}, the error is: {:?}",
                self.end_point, e
            );
        }
    }
}

/// Build a driver from `options` and serve it on `end_point`
pub fn launch(options: DriverOptions, end_point: &str) -> anyhow::Result<PluginHandle> {
    info!(
        "launching driver {} on node {} at {}, mock mount={}",
        options.driver_name, options.node_id, end_point, options.enable_amlfs_mock_mount,
    );
    launch_server(end_point, move |ep| Driver::new(&options).build_server(ep))
}

/// Serve the server built by `build` on `end_point` in a dedicated thread
///
/// Returns once the server has started, or with the error of building it.
pub fn launch_server<F>(end_point: &str, build: F) -> anyhow::Result<PluginHandle>
where
    F: FnOnce(&str) -> anyhow::Result<Server> + Send + 'static,
{
    launch_server_within(end_point, build, LAUNCH_TIMEOUT)
}

/// Serve the server built by `build`, waiting at most `timeout` for it to start
fn launch_server_within<F>(
    end_point: &str,
    build: F,
    timeout: Duration,
) -> anyhow::Result<PluginHandle>
where
    F: FnOnce(&str) -> anyhow::Result<Server> + Send + 'static,
{
    let _ = socket_path(end_point)?;
    let (ready_tx, ready_rx) = mpsc::channel();
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    let ep = end_point.to_owned();
    let serving_thread = thread::Builder::new()
        .name(SERVING_THREAD_NAME.to_owned())
        .spawn(move || serve(&ep, build, &ready_tx, &shutdown_rx))
        .context("failed to spawn the plugin serving thread")?;

    let mut handle = PluginHandle {
        end_point: end_point.to_owned(),
        shutdown_tx: Some(shutdown_tx),
        serving_thread: Some(serving_thread),
    };
    match ready_rx.recv_timeout(timeout) {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            handle.shutdown()?;
            Err(e.context(format!("failed to launch plugin on {}", end_point)))
        }
        Err(RecvTimeoutError::Timeout) => {
            // Detach the serving thread, it shuts the server down once built
            if let Some(tx) = handle.shutdown_tx.take() {
                let _ = tx.send(());
            }
            let _detached = handle.serving_thread.take();
            Err(anyhow!(
                "plugin on {} not started within {:?}",
                end_point,
                timeout,
            ))
        }
        Err(RecvTimeoutError::Disconnected) => {
            handle.shutdown()?;
            Err(anyhow!(
                "the serving thread of {} exited before the plugin started",
                end_point
            ))
        }
    }
}

/// Build, start and own the server until asked to shut down
fn serve<F>(
    end_point: &str,
    build: F,
    ready_tx: &Sender<anyhow::Result<()>>,
    shutdown_rx: &Receiver<()>,
) -> anyhow::Result<()>
where
    F: FnOnce(&str) -> anyhow::Result<Server>,
{
    let mut server = match build(end_point) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return Ok(());
        }
    };
    server.start();
    info!("CSI plugin listening on {}", end_point);
    let _ = ready_tx.send(Ok(()));

    // Returns on a shutdown request or when the handle is gone
    let _ = shutdown_rx.recv();
    futures::executor::block_on(server.shutdown())
        .context(format!("failed to shut down CSI gRPC server on {}", end_point))?;
    remove_socket_file(socket_path(end_point)?)?;
    debug!("CSI plugin on {} stopped", end_point);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_launch_and_stop() -> anyhow::Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir()?;
        let sock = dir.path().join("csi.sock");
        let end_point = format!("unix://{}", sock.display());
        let options = DriverOptions {
            node_id: "fakeNodeID".to_owned(),
            driver_name: "fake".to_owned(),
            enable_amlfs_mock_mount: true,
        };

        let handle = launch(options, &end_point)?;
        assert_eq!(handle.end_point(), end_point);
        assert!(sock.exists());
        handle.stop()?;
        assert!(!sock.exists());
        Ok(())
    }

    #[test]
    fn test_launch_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let end_point = format!("unix://{}", dir.path().join("csi.sock").display());
        let res = launch_server(&end_point, |_| Err(anyhow!("no server for you")));
        assert!(res.is_err());
        assert!(launch(DriverOptions::default(), "127.0.0.1:10000").is_err());
        Ok(())
    }

    #[test]
    fn test_launch_timeout_detaches_thread() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let end_point = format!("unix://{}", dir.path().join("csi.sock").display());
        let started = Instant::now();
        let res = launch_server_within(
            &end_point,
            |_| {
                thread::sleep(Duration::from_secs(3));
                Err(anyhow!("built too late"))
            },
            Duration::from_millis(100),
        );
        let err = match res {
            Ok(_) => panic!("launch of a slow server succeeded"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("not started within"));
        assert!(started.elapsed() < Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn test_launch_panicking_build() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let end_point = format!("unix://{}", dir.path().join("csi.sock").display());
        let res = launch_server(&end_point, |_| panic!("build exploded"));
        let err = match res {
            Ok(_) => panic!("launch of a panicking server succeeded"),
            Err(e) => e,
        };
        assert!(format!("{:#}", err).contains("panicked"));
        Ok(())
    }
}
