//! Vendor pool selection: round-robin by recency or performance by close rate.

use std::cmp::Ordering;
use std::fmt;

use lrp_core::{RoutingConfig, Vendor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no eligible vendor")]
pub struct NoEligibleVendor;

/// Uniform draws in `[0, 100)`.
pub trait RandomSource: Send + Sync {
    fn draw_percent(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRandom;

impl RandomSource for SystemRandom {
    fn draw_percent(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..100.0)
    }
}

/// Always returns the same draw.
#[derive(Debug, Clone, Copy)]
pub struct FixedDraw(pub f64);

impl RandomSource for FixedDraw {
    fn draw_percent(&self) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    RoundRobin,
    Performance,
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectionMethod::RoundRobin => "round_robin",
            SelectionMethod::Performance => "performance",
        })
    }
}

/// One independent draw per routing decision.
pub fn choose_method(performance_percentage: f64, random: &dyn RandomSource) -> SelectionMethod {
    if random.draw_percent() < performance_percentage {
        SelectionMethod::Performance
    } else {
        SelectionMethod::RoundRobin
    }
}

/// Longest idle vendor; never-assigned vendors first, ties keep pool order.
pub fn select_round_robin(vendors: &[Vendor]) -> Option<&Vendor> {
    vendors.iter().min_by_key(|v| v.last_lead_assigned)
}

/// Highest close rate; ties go to the longest idle vendor.
pub fn select_by_performance(vendors: &[Vendor]) -> Option<&Vendor> {
    vendors.iter().reduce(|best, candidate| {
        match candidate
            .lead_close_percentage
            .total_cmp(&best.lead_close_percentage)
        {
            Ordering::Greater => candidate,
            Ordering::Less => best,
            Ordering::Equal if candidate.last_lead_assigned < best.last_lead_assigned => candidate,
            Ordering::Equal => best,
        }
    })
}

#[derive(Debug, Clone, Copy)]
pub struct Selection<'a> {
    pub vendor: &'a Vendor,
    pub method: SelectionMethod,
}

pub fn select<'a>(
    vendors: &'a [Vendor],
    config: &RoutingConfig,
    random: &dyn RandomSource,
) -> Result<Selection<'a>, NoEligibleVendor> {
    if vendors.is_empty() {
        return Err(NoEligibleVendor);
    }
    let method = choose_method(config.performance_percentage(), random);
    let vendor = match method {
        SelectionMethod::RoundRobin => select_round_robin(vendors),
        SelectionMethod::Performance => select_by_performance(vendors),
    }
    .ok_or(NoEligibleVendor)?;
    Ok(Selection { vendor, method })
}
