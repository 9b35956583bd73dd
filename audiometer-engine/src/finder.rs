//! Threshold search
//!
//! Modified ascending method for one (ear, frequency) combination:
//!
//! 1. **Familiarization** - start at the configured level, drop by the
//!    large step while the tone is heard, raise by the large step while it
//!    is not. The first response after a miss fixes the starting search
//!    level.
//! 2. **Ascending runs** - each run starts a large step below the previous
//!    response (the first run starts at the starting search level) and
//!    climbs by the small step until the tone is heard. The response level
//!    of every run gets one hit.
//! 3. **Confirmation** - the first level with 3 hits within a window of up
//!    to 5 runs is the threshold. A full window without a confirmed level
//!    resets the counts and the next run starts a small step above the last
//!    response.
//!
//! Every search ends: a miss at the safety ceiling or reaching the
//! presentation cap yields NO_RESPONSE.
//!
//! [`ThresholdFinder`] is a pure state machine; [`find_threshold`] drives
//! it against a [`Presenter`].

use crate::error::Result;
use audiometer_common::{Ear, NoResponseReason, TestConfiguration, ThresholdOutcome};
use std::collections::BTreeMap;
use tracing::debug;

/// Hits needed to confirm a level
pub const REQUIRED_HITS: u32 = 3;

/// Ascending runs in one confirmation window
pub const RUNS_PER_WINDOW: u32 = 5;

/// Search parameters taken from the test configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    pub start_level_db: i32,
    pub small_step_db: i32,
    pub large_step_db: i32,
    pub safety_ceiling_db: i32,
    pub max_presentations: u32,
}

impl From<&TestConfiguration> for SearchParams {
    fn from(config: &TestConfiguration) -> Self {
        Self {
            start_level_db: config.start_level_db,
            small_step_db: config.small_step_db,
            large_step_db: config.large_step_db,
            safety_ceiling_db: config.safety_ceiling_db,
            max_presentations: config.max_presentations,
        }
    }
}

/// Search phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Coarse bracketing; `missed` records whether any tone went unheard
    Familiarization { level: i32, missed: bool },
    /// Climbing within an ascending run
    Ascending { level: i32 },
    Done(ThresholdOutcome),
}

/// Adaptive threshold search state machine
#[derive(Debug, Clone)]
pub struct ThresholdFinder {
    params: SearchParams,
    phase: Phase,
    presentations: u32,
    hits: BTreeMap<i32, u32>,
    runs_in_window: u32,
}

impl ThresholdFinder {
    pub fn new(params: SearchParams) -> Self {
        let start = params.start_level_db.clamp(0, params.safety_ceiling_db);
        Self {
            params,
            phase: Phase::Familiarization {
                level: start,
                missed: false,
            },
            presentations: 0,
            hits: BTreeMap::new(),
            runs_in_window: 0,
        }
    }

    /// Level of the next presentation, `None` once the search is done
    pub fn next_level(&self) -> Option<i32> {
        match self.phase {
            Phase::Familiarization { level, .. } | Phase::Ascending { level } => Some(level),
            Phase::Done(_) => None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn outcome(&self) -> Option<ThresholdOutcome> {
        match self.phase {
            Phase::Done(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Presentations observed so far
    pub fn presentations(&self) -> u32 {
        self.presentations
    }

    /// Hits per level in the current confirmation window
    pub fn hits(&self) -> &BTreeMap<i32, u32> {
        &self.hits
    }

    /// Feed the result of presenting [`Self::next_level`]
    ///
    /// Returns the outcome once the search is done. Calls after that are
    /// ignored.
    pub fn observe(&mut self, heard: bool) -> Option<ThresholdOutcome> {
        let phase = match self.phase {
            Phase::Done(outcome) => return Some(outcome),
            Phase::Familiarization { level, missed } => self.familiarize(level, missed, heard),
            Phase::Ascending { level } => self.ascend(level, heard),
        };
        self.presentations += 1;

        self.phase = match phase {
            Phase::Done(_) => phase,
            _ if self.presentations >= self.params.max_presentations => {
                Phase::Done(ThresholdOutcome::NoResponse {
                    reason: NoResponseReason::PresentationLimitReached,
                })
            }
            _ => phase,
        };
        self.outcome()
    }

    fn familiarize(&self, level: i32, missed: bool, heard: bool) -> Phase {
        let p = &self.params;
        match (heard, missed) {
            // First response after a miss: starting search level found
            (true, true) => Phase::Ascending { level },
            // Cannot bracket below 0; take 0 as the starting level
            (true, false) if level == 0 => Phase::Ascending { level: 0 },
            (true, false) => Phase::Familiarization {
                level: (level - p.large_step_db).max(0),
                missed: false,
            },
            (false, _) if level >= p.safety_ceiling_db => safety_limit(),
            (false, _) => Phase::Familiarization {
                level: (level + p.large_step_db).min(p.safety_ceiling_db),
                missed: true,
            },
        }
    }

    fn ascend(&mut self, level: i32, heard: bool) -> Phase {
        let p = self.params;
        if !heard {
            if level >= p.safety_ceiling_db {
                return safety_limit();
            }
            return Phase::Ascending {
                level: (level + p.small_step_db).min(p.safety_ceiling_db),
            };
        }

        let hits = self.hits.entry(level).or_insert(0);
        *hits += 1;
        self.runs_in_window += 1;
        debug!(
            "Ascending run {} responded at {} dBHL ({} hit(s))",
            self.runs_in_window, level, hits
        );

        if *hits >= REQUIRED_HITS {
            return Phase::Done(ThresholdOutcome::Threshold { level_db: level });
        }

        if self.runs_in_window >= RUNS_PER_WINDOW {
            debug!(
                "No level confirmed after {} runs, restarting above {} dBHL",
                RUNS_PER_WINDOW, level
            );
            self.hits.clear();
            self.runs_in_window = 0;
            return Phase::Ascending {
                level: (level + p.small_step_db).min(p.safety_ceiling_db),
            };
        }

        Phase::Ascending {
            level: (level - p.large_step_db).max(0),
        }
    }
}

fn safety_limit() -> Phase {
    Phase::Done(ThresholdOutcome::NoResponse {
        reason: NoResponseReason::SafetyLimitReached,
    })
}

/// Presents tones on behalf of the search driver
pub trait Presenter {
    /// Present one tone; `Ok(Some(true))` if it was heard, `Ok(None)` if
    /// cancellation interrupted the response window
    fn present(&mut self, ear: Ear, frequency_hz: u32, level_db: i32) -> Result<Option<bool>>;

    /// Checked before every presentation
    fn is_cancelled(&self) -> bool;
}

/// Run a complete search for one combination
///
/// Returns `Ok(None)` if cancellation was observed before a presentation
/// or cut a response window short; the partial search is discarded.
pub fn find_threshold<P: Presenter + ?Sized>(
    params: SearchParams,
    ear: Ear,
    frequency_hz: u32,
    presenter: &mut P,
) -> Result<Option<ThresholdOutcome>> {
    let mut finder = ThresholdFinder::new(params);

    while let Some(level) = finder.next_level() {
        if presenter.is_cancelled() {
            debug!("Search {} ear {} Hz cancelled", ear, frequency_hz);
            return Ok(None);
        }
        let Some(heard) = presenter.present(ear, frequency_hz, level)? else {
            debug!(
                "Search {} ear {} Hz cancelled during a response window",
                ear, frequency_hz
            );
            return Ok(None);
        };
        if let Some(outcome) = finder.observe(heard) {
            debug!(
                "Search {} ear {} Hz finished after {} presentations: {:?}",
                ear,
                frequency_hz,
                finder.presentations(),
                outcome
            );
            return Ok(Some(outcome));
        }
    }

    Ok(finder.outcome())
}
