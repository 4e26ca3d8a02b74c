//! Host CPU-budget derivation for the image builder (§4.3): allocate ≈60%
//! of available cores, minimum 2, maximum `total - 2`, with a more
//! aggressive allocation (`total - 4`, minimum 6) on machines with ≥12
//! cores. The Builder propagates this number to the image-build CLI via its
//! environment.

use std::num::NonZeroUsize;

use anyhow::{Context, Result};

/// Detect the host's logical core count.
pub fn detected_cores() -> Result<NonZeroUsize> {
    std::thread::available_parallelism().context("detecting available parallelism")
}

/// Compute the CPU budget to hand to the image builder for a host with
/// `total` logical cores.
pub fn cpu_budget(total: usize) -> u32 {
    if total == 0 {
        return 2;
    }

    if total >= 12 {
        let aggressive = total.saturating_sub(4);
        return aggressive.max(6) as u32;
    }

    let share = (total * 3) / 5; // ~60%
    let capped = share.min(total.saturating_sub(2));
    capped.max(2) as u32
}

/// Convenience wrapper: detect the host and compute its budget in one call.
pub fn detect_cpu_budget() -> Result<u32> {
    Ok(cpu_budget(detected_cores()?.get()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_host_uses_sixty_percent_floor_two() {
        assert_eq!(cpu_budget(2), 2);
        assert_eq!(cpu_budget(4), 2);
    }

    #[test]
    fn mid_host_uses_sixty_percent_capped_at_total_minus_two() {
        assert_eq!(cpu_budget(8), 4);
        assert_eq!(cpu_budget(10), 6);
    }

    #[test]
    fn large_host_uses_aggressive_allocation() {
        assert_eq!(cpu_budget(12), 8);
        assert_eq!(cpu_budget(16), 12);
    }

    #[test]
    fn large_host_never_drops_below_six() {
        assert_eq!(cpu_budget(12), 8);
    }

    #[test]
    fn zero_cores_is_defensive_floor() {
        assert_eq!(cpu_budget(0), 2);
    }

    #[test]
    fn detect_cpu_budget_runs() {
        let budget = detect_cpu_budget().expect("detect");
        assert!(budget >= 2);
    }
}
