//! Synthetic Inventory Feed
//!
//! Generates a tiered bond universe and pushes clamped random-walk price
//! updates into the pipeline at a configured rate. Stands in for a real
//! inventory provider; the tier conventions (id prefixes, volatility
//! bands) live entirely here and are never interpreted by the pipeline.
//!
//! # Universe tiers
//!
//! - 1% high-yield (`BB-`): coupon 8-14, 1-5y maturity, high volatility
//! - 20% treasury (`UST-`): coupon 2-4, 1-30y maturity, low volatility
//! - 79% corporate (`AAPL-` / `MSFT-` / `GOOGL-`): coupon 4-7, 1-10y
//!   maturity, medium volatility
//!
//! High-yield bonds are deliberately over-sampled in the update loop so
//! that duplicate-heavy windows show up in coalescing.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::application::services::BondSender;
use crate::domain::bond::Bond;

/// High-yield tier id prefix.
const JUNK_PREFIX: &str = "BB-";
/// Treasury tier id prefix.
const TREASURY_PREFIX: &str = "UST-";
/// Corporate tier issuers.
const CORPORATE_ISSUERS: [&str; 3] = ["AAPL", "MSFT", "GOOGL"];

/// Prices random-walk inside this band.
const PRICE_FLOOR: i64 = 500;
/// Upper price clamp.
const PRICE_CEILING: i64 = 1500;

// =============================================================================
// Settings
// =============================================================================

/// Feed tuning knobs.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Number of bonds in the generated universe.
    pub universe_size: usize,
    /// Updates emitted per tick.
    pub updates_per_tick: usize,
    /// Interval between update bursts.
    pub tick_interval: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        // ~2200 updates/sec, matching the upstream provider it mimics.
        Self {
            universe_size: 500_000,
            updates_per_tick: 550,
            tick_interval: Duration::from_millis(250),
        }
    }
}

// =============================================================================
// Universe Generation
// =============================================================================

/// Generate the starting bond universe in tier order.
#[must_use]
pub fn generate_universe(size: usize, rng: &mut StdRng) -> Vec<Bond> {
    let mut bonds = Vec::with_capacity(size);

    let junk_cutoff = size / 100;
    let treasury_cutoff = size * 21 / 100;

    let mut junk_counter = 0u32;
    let mut treasury_counter = 0u32;
    let mut corporate_counters = [0u32; CORPORATE_ISSUERS.len()];

    for i in 0..size {
        let (id, coupon, duration_days) = if i < junk_cutoff {
            let id = format!("{JUNK_PREFIX}{junk_counter:06}");
            junk_counter += 1;
            (id, rng.random_range(8..15), rng.random_range(365..1825))
        } else if i < treasury_cutoff {
            let id = format!("{TREASURY_PREFIX}{treasury_counter:06}");
            treasury_counter += 1;
            (id, rng.random_range(2..5), rng.random_range(365..10950))
        } else {
            let issuer = rng.random_range(0..CORPORATE_ISSUERS.len());
            let id = format!(
                "{}-{:06}",
                CORPORATE_ISSUERS[issuer], corporate_counters[issuer]
            );
            corporate_counters[issuer] += 1;
            (id, rng.random_range(4..8), rng.random_range(365..3650))
        };

        let base_price = 1000 + (coupon - 6) * 20 + rng.random_range(-100..=100);
        bonds.push(Bond {
            id,
            price: base_price.clamp(PRICE_FLOOR, PRICE_CEILING),
            face_value: 100,
            coupon,
            duration_days,
        });
    }

    bonds
}

/// Tier-dependent price step, `None` when the walk stands still.
fn price_step(bond: &Bond, rng: &mut StdRng) -> Option<i64> {
    let step = if bond.id.starts_with(JUNK_PREFIX) {
        rng.random_range(-50..=50)
    } else if bond.id.starts_with(TREASURY_PREFIX) {
        rng.random_range(-5..=5)
    } else {
        rng.random_range(-15..=15)
    };

    (step != 0).then_some(step)
}

// =============================================================================
// Feed
// =============================================================================

/// The running synthetic feed.
pub struct SyntheticFeed {
    bonds: Vec<Bond>,
    settings: FeedSettings,
    sender: BondSender,
    shutdown: CancellationToken,
    rng: StdRng,
}

impl SyntheticFeed {
    /// Generate a universe and prepare the update loop.
    #[must_use]
    pub fn new(settings: FeedSettings, sender: BondSender, shutdown: CancellationToken) -> Self {
        let mut rng = StdRng::from_os_rng();
        let bonds = generate_universe(settings.universe_size, &mut rng);

        tracing::info!(
            universe_size = bonds.len(),
            junk = bonds
                .iter()
                .filter(|b| b.id.starts_with(JUNK_PREFIX))
                .count(),
            "Bond universe generated"
        );

        Self {
            bonds,
            settings,
            sender,
            shutdown,
            rng,
        }
    }

    /// The generated universe, for seeding the cache before the feed runs.
    #[must_use]
    pub fn universe(&self) -> &[Bond] {
        &self.bonds
    }

    /// Emit update bursts until cancelled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.emit_burst().await,
            }
        }

        tracing::info!("Inventory feed stopped");
    }

    async fn emit_burst(&mut self) {
        if self.bonds.is_empty() {
            return;
        }

        for _ in 0..self.settings.updates_per_tick {
            let idx = self.pick_index();

            let Some(step) = price_step(&self.bonds[idx], &mut self.rng) else {
                continue;
            };

            let bond = &mut self.bonds[idx];
            bond.price = (bond.price + step).clamp(PRICE_FLOOR, PRICE_CEILING);

            self.sender.send(bond.clone()).await;
        }
    }

    /// Pick the next bond to update, over-sampling the high-yield tier.
    fn pick_index(&mut self) -> usize {
        if self.rng.random_bool(0.5) {
            for _ in 0..10 {
                let idx = self.rng.random_range(0..self.bonds.len());
                if self.bonds[idx].id.starts_with(JUNK_PREFIX) {
                    return idx;
                }
            }
        }

        self.rng.random_range(0..self.bonds.len())
    }
}

// =============================================================================
// Tests
// =============================================================================
