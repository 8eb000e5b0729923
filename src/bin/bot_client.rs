//! Headless client that wanders the map. Useful for load and soak testing.
//!
//! Usage: worldsim-bot [BOT_COUNT]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use worldsim::client::Client;
use worldsim::config::ClientConfig;
use worldsim::game::components::{Input, InputState, InputType};
use worldsim::game::Tick;
use worldsim::metrics::Metrics;

/// Ticks between direction changes
const MIN_DECISION_TICKS: u32 = 15;
const MAX_DECISION_TICKS: u32 = 90;

/// Picks a new heading every so often
struct Wanderer {
    rng: StdRng,
    input: Input,
    next_decision: Option<Tick>,
}

impl Wanderer {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            input: Input::default(),
            next_decision: None,
        }
    }

    fn input_for(&mut self, tick: Tick) -> Input {
        if self.next_decision.is_some_and(|next| (tick.wrapping_sub(next) as i32) < 0) {
            return self.input;
        }

        let mut input = Input::default();
        // Standing still some of the time keeps the heartbeat path busy
        if self.rng.gen_bool(0.8) {
            let x = [None, Some(InputType::XUp), Some(InputType::XDown)][self.rng.gen_range(0..3)];
            let y = [None, Some(InputType::YUp), Some(InputType::YDown)][self.rng.gen_range(0..3)];
            for input_type in [x, y].into_iter().flatten() {
                input.set(input_type, InputState::Pressed);
            }
        }
        self.input = input;
        self.next_decision = Some(tick.wrapping_add(self.rng.gen_range(MIN_DECISION_TICKS..=MAX_DECISION_TICKS)));
        input
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let bot_count: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 1,
    };

    let config = ClientConfig::load_or_default();
    config.validate().map_err(anyhow::Error::msg)?;
    info!("Starting {} bot(s) against {}", bot_count, config.server_address);

    let metrics = Arc::new(Metrics::new());
    let handles = (0..bot_count)
        .map(|index| {
            let config = config.clone();
            let metrics = metrics.clone();
            std::thread::Builder::new()
                .name(format!("bot-{}", index))
                .spawn(move || -> anyhow::Result<()> {
                    let mut client = Client::connect(&config, metrics)?;
                    let mut wanderer = Wanderer::new(rand::thread_rng().gen());
                    client.run(|tick| wanderer.input_for(tick))?;
                    Ok(())
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for (index, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => info!("Bot {} finished", index),
            Ok(Err(e)) => error!("Bot {} failed: {}", index, e),
            Err(_) => error!("Bot {} panicked", index),
        }
    }
    Ok(())
}
