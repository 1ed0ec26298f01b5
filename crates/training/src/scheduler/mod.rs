use crate::{config::SchedulerSection, TrainingError};

pub trait LRScheduler: Send {
    /// Advances one optimizer step and returns the rate to use for it.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

/// `factor * d_model^-0.5 * min(step^-0.5, step * warmup^-1.5)`, counted from step 1.
#[derive(Debug, Clone)]
pub struct NoamSchedule {
    d_model: usize,
    warmup_steps: usize,
    factor: f64,
    step: usize,
    current_lr: f64,
}

impl NoamSchedule {
    pub fn new(d_model: usize, warmup_steps: usize, factor: f64) -> Result<Self, TrainingError> {
        if d_model == 0 {
            return Err(TrainingError::initialization(
                "noam schedule requires d_model > 0",
            ));
        }
        if warmup_steps == 0 {
            return Err(TrainingError::initialization(
                "noam schedule requires warmup_steps > 0",
            ));
        }
        if !(factor.is_finite() && factor > 0.0) {
            return Err(TrainingError::initialization(
                "noam schedule requires factor > 0",
            ));
        }
        Ok(Self {
            d_model,
            warmup_steps,
            factor,
            step: 0,
            current_lr: 0.0,
        })
    }

    /// Rate at a given 1-based step; step 0 is treated as step 1.
    pub fn rate(&self, step: usize) -> f64 {
        let step = step.max(1) as f64;
        let warmup = self.warmup_steps as f64;
        let decay = step.powf(-0.5);
        let ramp = step * warmup.powf(-1.5);
        self.factor * (self.d_model as f64).powf(-0.5) * decay.min(ramp)
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}

impl LRScheduler for NoamSchedule {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.rate(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

#[derive(Debug, Clone)]
struct ConstantSchedule {
    learning_rate: f64,
}

impl LRScheduler for ConstantSchedule {
    fn step(&mut self) -> f64 {
        self.learning_rate
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

/// Builds the schedule described by `section` for a model of width `d_model`.
pub fn build_scheduler(
    section: &SchedulerSection,
    d_model: usize,
) -> Result<Box<dyn LRScheduler>, TrainingError> {
    match *section {
        SchedulerSection::Noam {
            warmup_steps,
            factor,
        } => Ok(Box::new(NoamSchedule::new(d_model, warmup_steps, factor)?)),
        SchedulerSection::Constant { learning_rate } => {
            if learning_rate <= 0.0 {
                return Err(TrainingError::initialization(
                    "scheduler requires base learning rate > 0",
                ));
            }
            Ok(Box::new(ConstantSchedule { learning_rate }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_rises_through_warmup_then_decays() {
        let schedule = NoamSchedule::new(512, 4_000, 1.0).unwrap();
        let early = schedule.rate(1);
        let peak = schedule.rate(4_000);
        let late = schedule.rate(40_000);
        assert!(early < peak);
        assert!(peak > late);
    }

    #[test]
    fn rate_is_monotone_on_each_side_of_warmup() {
        let schedule = NoamSchedule::new(64, 50, 2.0).unwrap();
        for step in 1..50 {
            assert!(schedule.rate(step) < schedule.rate(step + 1));
        }
        for step in 50..500 {
            assert!(schedule.rate(step) > schedule.rate(step + 1));
        }
    }

    #[test]
    fn peak_matches_closed_form() {
        let schedule = NoamSchedule::new(256, 100, 1.0).unwrap();
        let expected = 256f64.powf(-0.5) * 100f64.powf(-0.5);
        assert!((schedule.rate(100) - expected).abs() < 1e-12);
    }

    #[test]
    fn stepping_is_one_based() {
        let mut schedule = NoamSchedule::new(16, 10, 1.0).unwrap();
        assert_eq!(schedule.learning_rate(), 0.0);
        let first = schedule.step();
        assert_eq!(first, schedule.rate(1));
        assert_eq!(schedule.learning_rate(), first);
        assert!(schedule.step() > first);
    }

    #[test]
    fn zero_warmup_is_rejected() {
        assert!(NoamSchedule::new(16, 0, 1.0).is_err());
        assert!(build_scheduler(&SchedulerSection::Constant { learning_rate: 0.0 }, 16).is_err());
    }
}
