//! Warmup schedule with adaptive windows.
//!
//! Without edge selection the whole warmup is spent on the core stages:
//! Stage 1 (initial step-size buffer), Stage 2 (mass-matrix doubling
//! windows), Stage 3a (terminal step-size buffer). With edge selection and
//! proposal-SD learning the warmup is split 85%/10%/5% into core stages,
//! Stage 3b (proposal-SD tuning for the indicator moves) and Stage 3c
//! (step-size re-adaptation with selection active). Stage 3b is skipped
//! when its budget would be under 20 iterations.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleWarning {
    None,
    /// Warmup too short for meaningful adaptation (core < 20, or edge
    /// selection with warmup < 50).
    ExtremelyShort,
    /// The fixed stage buffers did not fit; proportional 15%/75%/10%
    /// allocation used instead.
    ProportionalFallback,
    /// Edge selection with warmup < 300: proposal-SD tuning runs but on a
    /// thin budget.
    LimitedProposalTuning,
    /// Stage 3b would get fewer than 20 iterations and was skipped.
    ProposalTuningSkipped,
}

#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    pub stage1_end: usize,
    /// Last index (exclusive) of each Stage-2 window.
    pub window_ends: Vec<usize>,
    pub stage3a_start: usize,
    /// First iteration of Stage 3b (equals `stage3c_start` when skipped).
    pub stage3b_start: usize,
    /// First iteration of Stage 3c (equals `total_warmup` when skipped).
    pub stage3c_start: usize,
    pub total_warmup: usize,
    pub learn_proposal_sd: bool,
    pub enable_selection: bool,
    pub warning: ScheduleWarning,
    pub stage3b_skipped: bool,
}

impl WarmupSchedule {
    const DEFAULT_INIT_BUFFER: usize = 75;
    const DEFAULT_TERM_BUFFER: usize = 50;
    const DEFAULT_BASE_WINDOW: usize = 25;

    pub fn new(warmup: usize, enable_selection: bool, learn_proposal_sd: bool) -> Self {
        let mut warning = ScheduleWarning::None;
        let mut stage3b_skipped = false;

        // Budget allocation.
        let (warmup_core, stage3b_budget);
        if enable_selection && learn_proposal_sd {
            let core = (0.85 * warmup as f64) as usize;
            let budget = (0.10 * warmup as f64) as usize;
            if budget < 20 {
                stage3b_skipped = true;
                warning = ScheduleWarning::ProposalTuningSkipped;
                warmup_core = warmup;
                stage3b_budget = 0;
            } else {
                if warmup < 300 {
                    warning = ScheduleWarning::LimitedProposalTuning;
                }
                warmup_core = core;
                stage3b_budget = budget;
            }
        } else {
            warmup_core = warmup;
            stage3b_budget = 0;
        }

        // Core stage buffers.
        let (init_buffer, term_buffer, base_window);
        if warmup_core < 20 {
            if warning == ScheduleWarning::None {
                warning = ScheduleWarning::ExtremelyShort;
            }
            init_buffer = warmup_core;
            term_buffer = 0;
            base_window = 0;
        } else if Self::DEFAULT_INIT_BUFFER + Self::DEFAULT_BASE_WINDOW + Self::DEFAULT_TERM_BUFFER
            > warmup_core
        {
            if warning == ScheduleWarning::None {
                warning = ScheduleWarning::ProportionalFallback;
            }
            init_buffer = (0.15 * warmup_core as f64) as usize;
            term_buffer = (0.10 * warmup_core as f64) as usize;
            base_window = warmup_core - init_buffer - term_buffer;
        } else {
            init_buffer = Self::DEFAULT_INIT_BUFFER;
            term_buffer = Self::DEFAULT_TERM_BUFFER;
            base_window = Self::DEFAULT_BASE_WINDOW;
        }

        if enable_selection && warmup < 50 && warning != ScheduleWarning::ExtremelyShort {
            warning = ScheduleWarning::ExtremelyShort;
        }

        let stage1_end = init_buffer;
        let stage3a_start = warmup_core - term_buffer;

        // Stage-2 doubling windows.
        let mut window_ends = Vec::new();
        if base_window > 0 && stage3a_start > stage1_end {
            let mut cur = stage1_end;
            let mut wsize = base_window;
            while cur < stage3a_start {
                let win = wsize.min(stage3a_start - cur);
                window_ends.push(cur + win);
                cur += win;
                wsize = (wsize * 2).min(stage3a_start - cur).max(1);
            }
        }

        WarmupSchedule {
            stage1_end,
            window_ends,
            stage3a_start,
            stage3b_start: warmup_core,
            stage3c_start: warmup_core + stage3b_budget,
            total_warmup: warmup,
            learn_proposal_sd,
            enable_selection,
            warning,
            stage3b_skipped,
        }
    }

    pub fn in_stage1(&self, i: usize) -> bool {
        i < self.stage1_end
    }

    pub fn in_stage2(&self, i: usize) -> bool {
        i >= self.stage1_end && i < self.stage3a_start
    }

    pub fn in_stage3a(&self, i: usize) -> bool {
        i >= self.stage3a_start && i < self.stage3b_start
    }

    pub fn in_stage3b(&self, i: usize) -> bool {
        !self.stage3b_skipped && i >= self.stage3b_start && i < self.stage3c_start
    }

    pub fn in_stage3c(&self, i: usize) -> bool {
        self.enable_selection
            && !self.stage3b_skipped
            && i >= self.stage3c_start
            && i < self.total_warmup
    }

    pub fn sampling(&self, i: usize) -> bool {
        i >= self.total_warmup
    }

    /// Whether indicator moves run at iteration `i` (Stage 3c and sampling).
    pub fn selection_enabled(&self, i: usize) -> bool {
        self.enable_selection && (self.in_stage3c(i) || self.sampling(i))
    }

    /// Whether proposal-SD tuning runs at iteration `i` (Stage 3b only).
    pub fn adapt_proposal_sd(&self, i: usize) -> bool {
        self.learn_proposal_sd && !self.stage3b_skipped && self.in_stage3b(i)
    }

    /// Stage-2 window index containing iteration `i`, if any.
    pub fn current_window(&self, i: usize) -> Option<usize> {
        self.window_ends.iter().position(|&end| i < end)
    }

    /// Whether iteration `i` is the last of a Stage-2 window.
    pub fn at_window_end(&self, i: usize) -> bool {
        self.in_stage2(i) && self.window_ends.contains(&(i + 1))
    }

    pub fn has_warning(&self) -> bool {
        self.warning != ScheduleWarning::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn standard_schedule_without_selection() {
        let s = WarmupSchedule::new(1000, false, false);
        assert_eq!(s.stage1_end, 75);
        assert_eq!(s.stage3a_start, 950);
        assert_eq!(s.stage3b_start, 1000);
        assert_eq!(s.stage3c_start, 1000);
        assert!(!s.has_warning());
        // windows double: 25, 50, 100, 200, 400, then truncated remainder
        assert_eq!(s.window_ends[0], 100);
        assert_eq!(s.window_ends[1], 150);
        assert_eq!(s.window_ends[2], 250);
        assert_eq!(*s.window_ends.last().unwrap(), 950);
    }

    #[test]
    fn selection_splits_budget() {
        let s = WarmupSchedule::new(1000, true, true);
        assert_eq!(s.stage3b_start, 850);
        assert_eq!(s.stage3c_start, 950);
        assert_eq!(s.total_warmup, 1000);
        assert!(!s.stage3b_skipped);
        assert!(s.in_stage3b(850));
        assert!(s.in_stage3b(949));
        assert!(s.in_stage3c(950));
        assert!(s.in_stage3c(999));
        assert!(s.sampling(1000));
        assert!(s.adapt_proposal_sd(900));
        assert!(!s.adapt_proposal_sd(950));
        assert!(s.selection_enabled(960));
        assert!(!s.selection_enabled(800));
        assert!(s.selection_enabled(1000));
    }

    #[test]
    fn stage3b_skipped_for_short_warmup() {
        // 10% of 150 = 15 < 20, so tuning is skipped and core gets it all
        let s = WarmupSchedule::new(150, true, true);
        assert!(s.stage3b_skipped);
        assert_eq!(s.warning, ScheduleWarning::ProposalTuningSkipped);
        assert_eq!(s.stage3b_start, 150);
        assert_eq!(s.stage3c_start, 150);
        assert!(!s.adapt_proposal_sd(150));
        // selection still turns on at the start of sampling
        assert!(s.selection_enabled(150));
        assert!(!s.in_stage3c(150));
    }

    #[test]
    fn proportional_fallback_for_mid_size_warmup() {
        let s = WarmupSchedule::new(100, false, false);
        assert_eq!(s.warning, ScheduleWarning::ProportionalFallback);
        assert_eq!(s.stage1_end, 15);
        assert_eq!(s.stage3a_start, 90);
    }

    #[test]
    fn degenerate_warmup() {
        let s = WarmupSchedule::new(10, false, false);
        assert_eq!(s.warning, ScheduleWarning::ExtremelyShort);
        assert_eq!(s.stage1_end, 10);
        assert!(s.window_ends.is_empty());
        assert!(s.sampling(10));
    }

    #[test]
    fn zero_warmup_runs_no_adaptation() {
        let s = WarmupSchedule::new(0, false, false);
        assert!(s.sampling(0));
        assert!(!s.in_stage1(0));
        assert!(!s.in_stage2(0));
        assert!(!s.adapt_proposal_sd(0));
    }

    #[test]
    fn stages_partition_the_warmup() {
        for &(warmup, sel) in &[(1000usize, true), (1000, false), (500, true), (237, false)] {
            let s = WarmupSchedule::new(warmup, sel, sel);
            for i in 0..warmup {
                let stages = [
                    s.in_stage1(i),
                    s.in_stage2(i),
                    s.in_stage3a(i),
                    s.in_stage3b(i),
                    s.in_stage3c(i),
                ];
                let active = stages.iter().filter(|&&x| x).count();
                assert_eq!(active, 1, "iteration {i} of warmup {warmup} sel {sel}");
                assert!(!s.sampling(i));
            }
            assert!(s.sampling(warmup));
        }
    }

    #[test]
    fn window_lookup_matches_ends() {
        let s = WarmupSchedule::new(1000, false, false);
        assert_eq!(s.current_window(75), Some(0));
        assert_eq!(s.current_window(99), Some(0));
        assert_eq!(s.current_window(100), Some(1));
        assert!(s.at_window_end(99));
        assert!(!s.at_window_end(98));
        assert_eq!(s.current_window(960), None);
    }
}
