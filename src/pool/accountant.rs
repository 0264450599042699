//! Memory accounting for the container pool.
//!
//! The accountant is owned by the pool task and only touched inside its
//! decision step, which makes every reserve/release totally ordered with
//! respect to admission decisions.

use thiserror::Error;

/// Released more memory than was reserved. The books are wrong and nothing
/// downstream can be trusted; the process exits with a dedicated code.
#[derive(Debug, Error)]
#[error("memory accounting underflow: released {released} MB with only {used} MB in use")]
pub struct AccountantCorruption {
    pub used: u64,
    pub released: u64,
}

#[derive(Debug)]
pub struct ResourceAccountant {
    limit_mb: u64,
    used_mb: u64,
}

impl ResourceAccountant {
    pub fn new(limit_mb: u64) -> Self {
        Self {
            limit_mb,
            used_mb: 0,
        }
    }

    pub fn limit_mb(&self) -> u64 {
        self.limit_mb
    }

    pub fn used_mb(&self) -> u64 {
        self.used_mb
    }

    pub fn free_mb(&self) -> u64 {
        self.limit_mb - self.used_mb
    }

    /// Reserve `mb` if it fits; returns the shortfall, zero on success.
    /// The caller decides how much idle memory to reclaim from the
    /// shortfall.
    pub fn try_reserve(&mut self, mb: u64) -> u64 {
        let free = self.free_mb();
        if mb <= free {
            self.used_mb += mb;
            0
        } else {
            mb - free
        }
    }

    pub fn release(&mut self, mb: u64) -> Result<(), AccountantCorruption> {
        if mb > self.used_mb {
            return Err(AccountantCorruption {
                used: self.used_mb,
                released: mb,
            });
        }
        self.used_mb -= mb;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_within_budget() {
        let mut acct = ResourceAccountant::new(512);
        assert_eq!(acct.try_reserve(256), 0);
        assert_eq!(acct.used_mb(), 256);
        assert_eq!(acct.free_mb(), 256);
    }

    #[test]
    fn test_reserve_reports_shortfall_without_mutating() {
        let mut acct = ResourceAccountant::new(512);
        assert_eq!(acct.try_reserve(384), 0);
        assert_eq!(acct.try_reserve(256), 128);
        // Failed reservation leaves the books untouched.
        assert_eq!(acct.used_mb(), 384);
    }

    #[test]
    fn test_release_restores_budget() {
        let mut acct = ResourceAccountant::new(512);
        acct.try_reserve(512);
        acct.release(256).unwrap();
        assert_eq!(acct.try_reserve(256), 0);
        assert_eq!(acct.used_mb(), 512);
    }

    #[test]
    fn test_release_underflow_is_fatal() {
        let mut acct = ResourceAccountant::new(512);
        acct.try_reserve(128);
        let err = acct.release(256).unwrap_err();
        assert_eq!(err.used, 128);
        assert_eq!(err.released, 256);
    }

    #[test]
    fn test_budget_law_sum_matches() {
        // Used memory always equals the sum of outstanding reservations.
        let mut acct = ResourceAccountant::new(1024);
        let reservations = [128u64, 256, 256];
        for r in &reservations {
            assert_eq!(acct.try_reserve(*r), 0);
        }
        assert_eq!(acct.used_mb(), reservations.iter().sum::<u64>());
        for r in &reservations {
            acct.release(*r).unwrap();
        }
        assert_eq!(acct.used_mb(), 0);
    }
}
