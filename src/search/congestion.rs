//! The budget of search frames a bucket may send per timer tick, adapted with AIMD in the
//!  spirit of TCP congestion control: a period without any response halves the budget and
//!  remembers the congestion threshold, a good response rate doubles it up to the threshold
//!  ('slow start'), and past the threshold it only grows additively.

use tracing::{instrument, trace};

#[derive(Debug)]
pub struct FramesPerTry {
    current: f64,
    max: f64,
    threshold: f64,
}

impl FramesPerTry {
    /// response rate at or above which the budget grows
    pub const SUCCESS_RATE: f64 = 0.9;

    pub fn new(initial: f64, max: f64) -> FramesPerTry {
        assert!(initial >= 1.0 && max >= initial);

        FramesPerTry {
            current: initial,
            max,
            threshold: max,
        }
    }

    #[cfg(test)]
    pub fn set_internals(&mut self, current: f64, threshold: f64) {
        self.current = current;
        self.threshold = threshold;
    }

    pub fn frames_per_try(&self) -> usize {
        (self.current.floor() as usize).max(1)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Adjusts the budget to the statistics of one bucket period
    pub fn on_period(&mut self, requests_sent: usize, responses: usize) {
        if requests_sent == 0 {
            return;
        }
        if responses == 0 {
            self.on_no_response();
        }
        else if responses as f64 >= requests_sent as f64 * Self::SUCCESS_RATE {
            self.on_good_response();
        }
    }

    #[instrument]
    fn on_no_response(&mut self) {
        self.threshold = (self.current / 2.0).max(1.0);
        self.current = self.threshold;
        trace!("no search responses - reducing frames per try to {}", self.current);
    }

    #[instrument]
    fn on_good_response(&mut self) {
        if self.current < self.threshold {
            self.current = (self.current * 2.0).min(self.threshold);
        }
        else {
            self.current += 1.0 / self.current;
        }
        self.current = self.current.min(self.max);
        trace!("good search response rate - frames per try is now {}", self.current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::nothing_sent(4.0, 8.0, 0, 0, 4.0, 8.0)]
    #[case::no_response(4.0, 8.0, 10, 0, 2.0, 2.0)]
    #[case::no_response_floor(1.0, 8.0, 10, 0, 1.0, 1.0)]
    #[case::mediocre_rate(4.0, 8.0, 10, 8, 4.0, 8.0)]
    #[case::slow_start(2.0, 8.0, 10, 9, 4.0, 8.0)]
    #[case::slow_start_capped_by_threshold(6.0, 8.0, 10, 10, 8.0, 8.0)]
    #[case::congestion_avoidance(8.0, 8.0, 10, 10, 8.125, 8.0)]
    #[case::max(32.0, 20.0, 10, 10, 32.0, 20.0)]
    fn test_on_period(
        #[case] current: f64,
        #[case] threshold: f64,
        #[case] sent: usize,
        #[case] responses: usize,
        #[case] expected_current: f64,
        #[case] expected_threshold: f64,
    ) {
        let mut budget = FramesPerTry::new(1.0, 32.0);
        budget.set_internals(current, threshold);
        budget.on_period(sent, responses);
        assert_eq!(budget.current, expected_current);
        assert_eq!(budget.threshold(), expected_threshold);
    }

    #[test]
    fn test_frames_per_try_is_at_least_one() {
        let mut budget = FramesPerTry::new(1.0, 32.0);
        for _ in 0..10 {
            budget.on_period(5, 0);
        }
        assert_eq!(budget.frames_per_try(), 1);
        for _ in 0..10 {
            budget.on_period(5, 5);
        }
        assert!(budget.frames_per_try() > 1);
    }
}
