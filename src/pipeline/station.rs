//! Station abstraction and its dedicated-thread runner.
//!
//! A station owns its state exclusively and consumes inputs strictly in the
//! order they arrive on its channel, which is how per-session single-writer
//! processing is obtained for stages that mutate session state.

use crate::error::{OrchestratorError, Result};
use crate::pipeline::error::{ErrorReporter, StationError};
use crossbeam_channel::{Receiver, Sender};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A processing stage connected to its neighbours by channels.
pub trait Station: Send + 'static {
    /// The input type this station receives.
    type Input: Send + 'static;
    /// The output type this station produces.
    type Output: Send + 'static;

    /// Processes a single input item.
    ///
    /// Returns:
    /// - `Ok(Some(output))` - processed and produced output
    /// - `Ok(None)` - processed, nothing to forward
    /// - `Err(StationError)` - processing failed
    fn process(&mut self, input: Self::Input) -> std::result::Result<Option<Self::Output>, StationError>;

    /// Name used in logs and error reports.
    fn name(&self) -> &'static str;

    /// Called once when the input channel closes or a fatal error occurs.
    fn shutdown(&mut self) {}
}

/// Runs a station in a dedicated thread.
pub struct StationRunner<S: Station> {
    handle: Option<JoinHandle<()>>,
    station_name: &'static str,
    _phantom: PhantomData<S>,
}

impl<S: Station> StationRunner<S> {
    /// Spawns `station` on its own thread.
    ///
    /// The thread exits when `input_rx` disconnects, when `output_tx` has no
    /// receiver left, or on a fatal station error.
    pub fn spawn(
        mut station: S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let station_name = station.name();

        let handle = thread::Builder::new()
            .name(format!("station-{}", station_name.to_ascii_lowercase()))
            .spawn(move || {
                Self::run_station(&mut station, input_rx, output_tx, error_reporter);
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(station = station_name, error = %e, "failed to spawn station thread");
                None
            }
        };

        Self {
            handle,
            station_name,
            _phantom: PhantomData,
        }
    }

    fn run_station(
        station: &mut S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) {
        let station_name = station.name();
        tracing::debug!(station = station_name, "station started");

        while let Ok(input) = input_rx.recv() {
            match station.process(input) {
                Ok(Some(output)) => {
                    if output_tx.send(output).is_err() {
                        tracing::debug!(station = station_name, "downstream closed");
                        break;
                    }
                }
                Ok(None) => {}
                Err(err @ StationError::Recoverable(_)) => {
                    error_reporter.report(station_name, &err);
                }
                Err(err @ StationError::Fatal(_)) => {
                    error_reporter.report(station_name, &err);
                    break;
                }
            }
        }

        station.shutdown();
        tracing::debug!(station = station_name, "station stopped");
    }

    /// Waits for the station thread to finish.
    pub fn join(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| {
                OrchestratorError::Other(format!("Station '{}' thread panicked", self.station_name))
            }),
            None => Err(OrchestratorError::Other(format!(
                "Station '{}' never started",
                self.station_name
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.station_name
    }
}
