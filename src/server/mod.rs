//! Authoritative server: simulation plus connection handling, driven from a
//! single fixed-timestep loop

pub mod network;
pub mod session;
pub mod simulation;
pub mod systems;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::game::constants::sim::{NETWORK_TICK_RATE, TICK_DURATION_US};
use crate::game::tick_loop::{sleep_for_slack, PeriodicCaller, TickScheduler};
use crate::game::SimError;
use crate::metrics::Metrics;
use network::ServerNetwork;
use simulation::ServerSimulation;

pub struct Server {
    pub network: ServerNetwork,
    pub simulation: ServerSimulation,
    scheduler: TickScheduler,
    network_send: PeriodicCaller,
    exit_requested: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: &ServerConfig, metrics: Arc<Metrics>) -> Result<Self, SimError> {
        let simulation = ServerSimulation::new(config, metrics.clone())?;
        Ok(Self::from_parts(ServerNetwork::new(config, metrics), simulation))
    }

    pub fn from_parts(network: ServerNetwork, simulation: ServerSimulation) -> Self {
        let now = Instant::now();
        let mut scheduler = TickScheduler::new(Duration::from_micros(TICK_DURATION_US));
        scheduler.start(now);
        Self {
            network,
            simulation,
            scheduler,
            network_send: PeriodicCaller::new(Duration::from_secs(1) / NETWORK_TICK_RATE, now),
            exit_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set this to stop `run`
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        self.exit_requested.clone()
    }

    /// Process every due tick and, if it's time, send queued messages.
    /// Returns how long the loop may sleep.
    pub fn run_once(&mut self, now: Instant) -> Result<Duration, SimError> {
        for _ in 0..self.scheduler.ticks_to_process(now) {
            self.simulation.tick(&mut self.network)?;
        }
        if self.network_send.poll(now) {
            self.network.send_all(self.simulation.latest_processed())?;
        }
        Ok(self
            .scheduler
            .time_until_next_tick(now)
            .min(self.network_send.time_until_next(now)))
    }

    /// Loop until the exit flag is set or the simulation fails
    pub fn run(&mut self) -> Result<(), SimError> {
        info!("Server loop started");
        let result = loop {
            if self.exit_requested.load(Ordering::Acquire) {
                break Ok(());
            }
            match self.run_once(Instant::now()) {
                Ok(slack) => sleep_for_slack([slack]),
                Err(e) => {
                    error!("Simulation failed: {}", e);
                    break Err(e);
                }
            }
        };
        self.network.shutdown();
        info!("Server loop stopped at tick {}", self.simulation.current_tick);
        result
    }
}
