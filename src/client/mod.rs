//! Client: connection, prediction and replication on a fixed-timestep loop
//! that runs a few ticks ahead of the server

pub mod camera;
pub mod connection;
pub mod prediction;
pub mod simulation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::config::ClientConfig;
use crate::game::components::Input;
use crate::game::constants::sim::{NETWORK_TICK_RATE, TICK_DURATION_US};
use crate::game::tick_loop::{sleep_for_slack, PeriodicCaller, TickScheduler};
use crate::game::{SimError, Tick};
use crate::metrics::Metrics;
use crate::net::NetworkError;
use connection::ServerConnection;
use simulation::ClientSimulation;

pub struct Client {
    pub connection: ServerConnection,
    pub simulation: ClientSimulation,
    scheduler: TickScheduler,
    network_send: PeriodicCaller,
    exit_requested: Arc<AtomicBool>,
}

impl Client {
    /// Connect and wait for the server to assign our entity
    pub fn connect(config: &ClientConfig, metrics: Arc<Metrics>) -> Result<Self, SimError> {
        let connection = ServerConnection::connect(config)?;
        Self::from_connection(connection, metrics, config.connection_timeout)
    }

    pub fn from_connection(
        connection: ServerConnection,
        metrics: Arc<Metrics>,
        timeout: Duration,
    ) -> Result<Self, SimError> {
        let response = connection.wait_for_response(timeout)?;
        info!("Connected as {} at {:?}", response.entity, response.position);
        let simulation = ClientSimulation::new(&response, metrics)?;

        let now = Instant::now();
        let mut scheduler = TickScheduler::new(Duration::from_micros(TICK_DURATION_US));
        scheduler.start(now);
        Ok(Self {
            connection,
            simulation,
            scheduler,
            network_send: PeriodicCaller::new(Duration::from_secs(1) / NETWORK_TICK_RATE, now),
            exit_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Set this to stop `run`
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        self.exit_requested.clone()
    }

    /// Process every due tick, taking each tick's input from `input_for`, and
    /// send if it's time. Returns how long the loop may sleep.
    pub fn run_once(&mut self, now: Instant, mut input_for: impl FnMut(Tick) -> Input) -> Result<Duration, SimError> {
        if !self.connection.is_connected() {
            return Err(self.connection.take_error().unwrap_or(NetworkError::Disconnected).into());
        }

        let adjustment = self.connection.take_adjustment();
        if adjustment != 0 {
            debug!(
                "Adjusting tick rate by {} ticks (mean server diff {:?})",
                adjustment,
                self.connection.mean_tick_diff()
            );
            self.scheduler.adjust(adjustment);
        }

        for _ in 0..self.scheduler.ticks_to_process(now) {
            let input = input_for(self.simulation.current_tick);
            self.simulation.tick(&self.connection, input)?;
        }

        if self.network_send.poll(now) {
            self.connection.send_pending(self.simulation.current_tick)?;
        }
        Ok(self
            .scheduler
            .time_until_next_tick(now)
            .min(self.network_send.time_until_next(now)))
    }

    /// Loop until the exit flag is set or the connection fails
    pub fn run(&mut self, mut input_for: impl FnMut(Tick) -> Input) -> Result<(), SimError> {
        let result = loop {
            if self.exit_requested.load(Ordering::Acquire) {
                break Ok(());
            }
            match self.run_once(Instant::now(), &mut input_for) {
                Ok(slack) => sleep_for_slack([slack]),
                Err(e) => {
                    error!("Client stopped: {}", e);
                    break Err(e);
                }
            }
        };
        self.connection.close();
        result
    }
}
