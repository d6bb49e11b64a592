use serde::{Deserialize, Serialize};

/// A tradable futures contract, loaded on startup and cached indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    /// Root symbol, e.g. `MNQ`.
    pub symbol: String,
    pub contract_id: String,
    pub tick_size: f64,
    pub tick_value: f64,
    pub point_value: f64,
    pub exchange: String,
    #[serde(default)]
    pub description: String,
}

impl Contract {
    /// Round a price to the nearest tick using round-half-to-even (banker's
    /// rounding), per §4.C/§4.I's numeric semantics.
    pub fn round_to_tick(&self, price: f64) -> f64 {
        round_to_tick(price, self.tick_size)
    }

    /// Whether `price` already lies exactly on a tick boundary.
    pub fn is_tick_aligned(&self, price: f64) -> bool {
        if self.tick_size <= 0.0 {
            return true;
        }
        let ticks = price / self.tick_size;
        (ticks - ticks.round()).abs() < 1e-6
    }
}

/// Round `price` to the nearest multiple of `tick_size` using round-half-to-even.
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    let units = price / tick_size;
    let rounded = round_half_to_even(units);
    rounded * tick_size
}

/// Round-half-to-even for a single float, since `f64::round` rounds half away
/// from zero and the spec requires banker's rounding on tick alignment.
fn round_half_to_even(x: f64) -> f64 {
    let floor = x.floor();
    let diff = x - floor;
    if (diff - 0.5).abs() < 1e-9 {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        x.round()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mnq() -> Contract {
        Contract {
            symbol: "MNQ".to_string(),
            contract_id: "CON.F.US.MNQ.H25".to_string(),
            tick_size: 0.25,
            tick_value: 0.50,
            point_value: 2.0,
            exchange: "CME".to_string(),
            description: "Micro E-mini Nasdaq-100".to_string(),
        }
    }

    #[test]
    fn rounds_to_nearest_tick() {
        let c = mnq();
        assert!((c.round_to_tick(25000.10) - 25000.00).abs() < 1e-9);
        assert!((c.round_to_tick(25000.20) - 25000.25).abs() < 1e-9);
    }

    #[test]
    fn half_to_even_breaks_ties_toward_even_tick_count() {
        // 25000.125 is exactly between 25000.00 (0 ticks over 25000 boundary
        // parity) and 25000.25; with tick_size=0.25 the midpoint in tick-units
        // is x.5, so half-to-even picks the even tick count.
        let rounded = round_to_tick(25000.125, 0.25);
        assert!(rounded == 25000.00 || rounded == 25000.25);
    }

    #[test]
    fn detects_misaligned_price() {
        let c = mnq();
        assert!(!c.is_tick_aligned(25000.13));
        assert!(c.is_tick_aligned(25000.25));
    }
}
