use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::{
    api::PenaltyReport,
    models::{FinishReason, SessionDescriptor, SessionStats, SessionSummary},
    presence::{PresenceLinkState, PresenceTracker},
    settings::{PresenceSettings, SessionRules},
};

use super::{
    events::{Notice, PenaltySource, PresenceSignal, SessionEffect, SessionEvent},
    state::{AppLifecycleState, RuntimeTimerState, SessionPhase, SessionSnapshot},
};

pub const END_EARLY_PROMPT: &str =
    "Ending early deducts 50% of the points for this session. End the session now?";

/// A foreground transition whose background interval began within this many
/// seconds of a relaunch recovery belongs to the launch itself.
const RELAUNCH_GRACE_SECS: i64 = 5;

/// Pure session state machine. Every input goes through [`handle`], which
/// mutates in-memory state and returns the side effects to perform.
///
/// [`handle`]: SessionController::handle
pub struct SessionController {
    descriptor: SessionDescriptor,
    stats: SessionStats,
    rules: SessionRules,
    phase: SessionPhase,
    timer: RuntimeTimerState,
    milestones_shown: Vec<bool>,
    warnings_shown: Vec<bool>,
    last_remaining: u64,
    presence: Option<PresenceTracker>,
    recovered_at: Option<DateTime<Utc>>,
    ticks_since_persist: u32,
}

impl SessionController {
    /// `presence` is `Some` only when the session has AI monitoring enabled and
    /// the camera is usable.
    pub fn new(
        descriptor: SessionDescriptor,
        stats: SessionStats,
        rules: SessionRules,
        presence: Option<&PresenceSettings>,
    ) -> Self {
        let mut warnings = rules.warning_thresholds_secs.clone();
        warnings.sort_unstable_by(|a, b| b.cmp(a));
        warnings.dedup();
        let rules = SessionRules {
            warning_thresholds_secs: warnings,
            ..rules
        };

        let presence = presence
            .filter(|_| descriptor.ai_enabled)
            .map(PresenceTracker::new);

        Self {
            milestones_shown: vec![false; rules.milestone_percents.len()],
            warnings_shown: vec![false; rules.warning_thresholds_secs.len()],
            descriptor,
            stats,
            rules,
            phase: SessionPhase::Loading,
            timer: RuntimeTimerState::default(),
            last_remaining: 0,
            presence,
            recovered_at: None,
            ticks_since_persist: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn timer(&self) -> &RuntimeTimerState {
        &self.timer
    }

    pub fn is_ended(&self) -> bool {
        self.timer.ended
    }

    pub fn presence_enabled(&self) -> bool {
        self.presence.is_some()
    }

    /// Back navigation is swallowed for as long as the session is live.
    pub fn intercepts_back(&self) -> bool {
        !self.timer.ended
    }

    /// Leaves `Loading`. `last_active` is the marker left by a previous
    /// process; a plausible one is accounted as a background interval.
    pub fn initialize(
        &mut self,
        last_active: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Vec<SessionEffect> {
        if self.phase != SessionPhase::Loading {
            return Vec::new();
        }

        let mut effects = Vec::new();
        self.timer.start_timestamp = Some(self.descriptor.start_time);
        self.timer.foreground_since = Some(now);
        self.phase = SessionPhase::Running;

        let (elapsed, remaining, _) = self.progress(now);
        self.timer.remaining = remaining;
        self.last_remaining = remaining;
        for (shown, percent) in self
            .milestones_shown
            .iter_mut()
            .zip(&self.rules.milestone_percents)
        {
            *shown = reached_percent(elapsed, self.descriptor.duration, *percent);
        }

        if let Some(marker) = last_active {
            if self.is_plausible_marker(marker, now) {
                info!(
                    "Recovering {}s spent outside the app before relaunch of session {}",
                    (now - marker).num_seconds(),
                    self.descriptor.session_key
                );
                self.account_background(marker, now, &mut effects);
                self.recovered_at = Some(now);
            } else {
                warn!("Ignoring implausible last-active marker {marker}");
            }
            effects.push(SessionEffect::ClearLastActive);
        }

        effects.push(SessionEffect::EnsureTicker);
        self.connect_presence(&mut effects);
        effects.extend(self.tick(now));
        effects
    }

    pub fn handle(&mut self, event: SessionEvent, now: DateTime<Utc>) -> Vec<SessionEffect> {
        if self.timer.ended || self.phase == SessionPhase::Loading {
            debug!("Dropping {event:?} in phase {:?}", self.phase);
            return Vec::new();
        }

        match event {
            SessionEvent::Tick => self.tick(now),
            SessionEvent::Lifecycle(state) if state.is_foreground() => self.on_foreground(now),
            SessionEvent::Lifecycle(state) => self.on_background(state, now),
            SessionEvent::Presence(signal) => self.on_presence(signal, now),
            SessionEvent::EndEarlyConfirmed => self.end_early(now),
            SessionEvent::DisablePresence => self.disable_presence(now),
        }
    }

    /// Returns `(elapsed, remaining, completed_percent)` derived from the start
    /// anchor alone.
    pub fn progress(&self, now: DateTime<Utc>) -> (u64, u64, u8) {
        let duration = self.descriptor.duration;
        let elapsed = ((now - self.descriptor.start_time).num_seconds().max(0) as u64).min(duration);
        let remaining = duration - elapsed;
        let percent = if duration == 0 {
            100
        } else {
            ((elapsed as f64 * 100.0) / duration as f64).round() as u8
        };
        (elapsed, remaining, percent)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        let (elapsed, remaining, percent) = if self.timer.ended {
            (
                self.stats.total_study_time,
                0,
                self.stats.completed_percent,
            )
        } else {
            self.progress(now)
        };

        SessionSnapshot {
            phase: self.phase,
            session_key: self.descriptor.session_key.clone(),
            subject: self.descriptor.subject.clone(),
            duration_secs: self.descriptor.duration,
            elapsed_secs: elapsed,
            remaining_secs: remaining,
            completed_percent: percent,
            stats: self.stats.clone(),
            presence: self.presence.as_ref().map(PresenceTracker::snapshot),
        }
    }

    fn tick(&mut self, now: DateTime<Utc>) -> Vec<SessionEffect> {
        if self.phase != SessionPhase::Running {
            return Vec::new();
        }

        let (elapsed, remaining, percent) = self.progress(now);
        self.timer.remaining = remaining;
        self.stats.completed_percent = percent;
        self.stats.total_study_time = elapsed;

        let mut effects = vec![SessionEffect::PersistLastActive(now)];

        if remaining == 0 {
            self.last_remaining = 0;
            self.finalize(FinishReason::Completed, now, &mut effects);
            return effects;
        }

        self.check_milestones(elapsed, &mut effects);
        self.check_warnings(remaining, &mut effects);

        self.ticks_since_persist += 1;
        if self.ticks_since_persist >= self.rules.persist_every_ticks.max(1) {
            self.ticks_since_persist = 0;
            effects.push(SessionEffect::PersistStats(self.stats.clone()));
        }

        effects
    }

    fn check_milestones(&mut self, elapsed: u64, effects: &mut Vec<SessionEffect>) {
        let mut highest = None;
        for (shown, percent) in self
            .milestones_shown
            .iter_mut()
            .zip(&self.rules.milestone_percents)
        {
            if !*shown && reached_percent(elapsed, self.descriptor.duration, *percent) {
                *shown = true;
                highest = highest.max(Some(*percent));
            }
        }

        if let Some(percent) = highest {
            effects.push(self.notice(Notice::Milestone { percent }));
        }
    }

    /// One-shot downward crossing of each threshold. Skipped seconds still
    /// trigger, and the most urgent threshold wins when several are crossed.
    fn check_warnings(&mut self, remaining: u64, effects: &mut Vec<SessionEffect>) {
        let previous = self.last_remaining;
        self.last_remaining = remaining;

        let mut most_urgent = None;
        for (shown, threshold) in self
            .warnings_shown
            .iter_mut()
            .zip(&self.rules.warning_thresholds_secs)
        {
            if !*shown && previous > *threshold && remaining <= *threshold {
                *shown = true;
                most_urgent = Some(*threshold);
            }
        }

        if let Some(threshold) = most_urgent {
            effects.push(self.notice(Notice::TimeWarning {
                remaining_secs: threshold,
            }));
        }
    }

    fn on_background(&mut self, state: AppLifecycleState, now: DateTime<Utc>) -> Vec<SessionEffect> {
        if self.phase != SessionPhase::Running {
            return Vec::new();
        }

        debug!("App moved to {state:?}; session {} backgrounded", self.descriptor.session_key);
        let mut effects = Vec::new();
        self.phase = SessionPhase::Backgrounded;
        self.timer.bg_start = Some(now);
        self.timer.close_foreground(now);

        effects.push(SessionEffect::PersistLastActive(now));
        effects.push(SessionEffect::ScheduleNotification {
            title: "Your study session is still running".to_string(),
            body: format!(
                "Come back to {} to keep your streak. Time away counts against you.",
                self.descriptor.subject
            ),
        });
        self.teardown_presence(now, &mut effects);
        effects
    }

    fn on_foreground(&mut self, now: DateTime<Utc>) -> Vec<SessionEffect> {
        if self.phase != SessionPhase::Backgrounded {
            return Vec::new();
        }

        let mut effects = Vec::new();
        let bg_start = self.timer.bg_start.take();
        let recovered_at = self.recovered_at.take();
        self.phase = SessionPhase::Running;
        self.timer.foreground_since = Some(now);

        match (bg_start, recovered_at) {
            (Some(start), Some(recovered))
                if (start - recovered).num_seconds() <= RELAUNCH_GRACE_SECS =>
            {
                debug!("First resume after relaunch recovery; not counting it again");
            }
            (Some(start), _) => self.account_background(start, now, &mut effects),
            (None, _) => {}
        }

        effects.push(SessionEffect::EnsureTicker);
        self.connect_presence(&mut effects);
        effects.extend(self.tick(now));
        effects
    }

    /// Applies the background accounting rules to `[from, to]`, clamped to the
    /// scheduled end of the session.
    fn account_background(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        effects: &mut Vec<SessionEffect>,
    ) {
        let end = to.min(self.descriptor.ends_at());
        let secs = (end - from).num_seconds().max(0) as u64;

        let violation = self.stats.record_background(
            from.format("%H:%M:%S").to_string(),
            secs,
            self.rules.violation_threshold_secs,
        );
        info!(
            "Session {} was in background for {secs}s (violation: {violation})",
            self.descriptor.session_key
        );
        effects.push(SessionEffect::PersistStats(self.stats.clone()));

        self.push_penalty(secs, PenaltySource::Background, effects);
        if violation {
            effects.push(self.notice(Notice::AwayTooLong { secs }));
        }
    }

    fn push_penalty(&self, secs: u64, source: PenaltySource, effects: &mut Vec<SessionEffect>) {
        let minutes = self.rules.penalty_minutes(secs);
        if minutes == 0 {
            return;
        }
        match &self.descriptor.session_id {
            Some(session_id) => effects.push(SessionEffect::ReportPenalty {
                report: PenaltyReport {
                    session_id: session_id.clone(),
                    duration_minutes: minutes,
                },
                source,
            }),
            None => warn!(
                "No server id for session {}; {minutes} penalty minute(s) not reported",
                self.descriptor.session_key
            ),
        }
    }

    fn on_presence(&mut self, signal: PresenceSignal, now: DateTime<Utc>) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        let Some(tracker) = self.presence.as_mut() else {
            return effects;
        };

        match signal {
            // Signals arrive in loop order, so a late `Disconnected` from a
            // torn-down loop is always followed by the new loop's `Connected`.
            PresenceSignal::Connected => {
                if self.phase == SessionPhase::Running {
                    tracker.link = PresenceLinkState::Connected;
                }
            }
            PresenceSignal::Disconnected => {
                tracker.link = PresenceLinkState::Disconnected;
            }
            PresenceSignal::Message(text) => {
                if self.phase != SessionPhase::Running || tracker.link != PresenceLinkState::Connected
                {
                    return effects;
                }
                if let Some(secs) = tracker.observe(&text, now) {
                    self.absence_closed(secs, &mut effects);
                }
            }
        }
        effects
    }

    fn absence_closed(&mut self, secs: u64, effects: &mut Vec<SessionEffect>) {
        debug!("Absence interval of {secs}s closed");
        if secs >= self.rules.penalty_unit_secs {
            self.push_penalty(secs, PenaltySource::Absence, effects);
            effects.push(self.notice(Notice::AbsentTooLong { secs }));
        }
    }

    fn connect_presence(&mut self, effects: &mut Vec<SessionEffect>) {
        if let Some(tracker) = self.presence.as_mut() {
            tracker.link = PresenceLinkState::Connecting;
            effects.push(SessionEffect::ConnectPresence);
        }
    }

    /// Closes any open absence so accrued time is never silently dropped,
    /// then asks for the socket to go away.
    fn teardown_presence(&mut self, now: DateTime<Utc>, effects: &mut Vec<SessionEffect>) {
        let Some(tracker) = self.presence.as_mut() else {
            return;
        };
        tracker.link = PresenceLinkState::Disconnected;
        if let Some(secs) = tracker.close(now) {
            self.absence_closed(secs, effects);
        }
        effects.push(SessionEffect::DisconnectPresence);
    }

    fn disable_presence(&mut self, now: DateTime<Utc>) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        self.teardown_presence(now, &mut effects);
        self.presence = None;
        effects
    }

    fn end_early(&mut self, now: DateTime<Utc>) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        if let Some(session_id) = self.descriptor.session_id.clone() {
            effects.push(SessionEffect::EndEarlyRemote { session_id });
        }
        let (elapsed, _, percent) = self.progress(now);
        self.stats.completed_percent = percent;
        self.stats.total_study_time = elapsed;
        self.finalize(FinishReason::EndedEarly, now, &mut effects);
        effects
    }

    fn finalize(&mut self, reason: FinishReason, now: DateTime<Utc>, effects: &mut Vec<SessionEffect>) {
        self.timer.ended = true;
        self.timer.remaining = 0;
        self.timer.close_foreground(now);
        self.phase = SessionPhase::Ended;

        effects.push(SessionEffect::StopTicker);
        self.teardown_presence(now, effects);
        effects.push(SessionEffect::ClearSession {
            session_key: self.descriptor.session_key.clone(),
        });
        effects.push(SessionEffect::ClearLastActive);

        let studied = self.stats.total_study_time;
        let out_of_app = self.stats.total_background_time.min(studied);
        info!(
            "Session {} finished ({reason:?}): {}% done, {studied}s studied, {}s foreground this run",
            self.descriptor.session_key, self.stats.completed_percent, self.timer.foreground_secs
        );

        effects.push(SessionEffect::Finished(SessionSummary {
            session_key: self.descriptor.session_key.clone(),
            session_id: self.descriptor.session_id.clone(),
            subject: self.descriptor.subject.clone(),
            reason,
            completed_percent: self.stats.completed_percent,
            studied_secs: studied,
            in_app_secs: studied - out_of_app,
            out_of_app_secs: out_of_app,
            background_exit_count: self.stats.background_exit_count,
            violation_count: self.stats.violation_count,
            background_logs: self.stats.background_logs.clone(),
        }));
    }

    fn is_plausible_marker(&self, marker: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let gap = (now - marker).num_seconds();
        marker < now
            && marker >= self.descriptor.start_time
            && gap <= self.rules.max_recovery_gap_secs.min(i64::MAX as u64) as i64
    }

    fn notice(&self, notice: Notice) -> SessionEffect {
        SessionEffect::ShowNotice {
            notice,
            dismiss_after: Duration::from_secs(self.rules.notice_dismiss_secs),
        }
    }
}

fn reached_percent(elapsed: u64, duration: u64, percent: u8) -> bool {
    elapsed.saturating_mul(100) >= duration.saturating_mul(percent as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + ChronoDuration::seconds(secs)
    }

    fn descriptor(duration: u64, ai_enabled: bool) -> SessionDescriptor {
        let mut descriptor =
            SessionDescriptor::new("Biology", duration, Some("srv-1".into()), ai_enabled, t0());
        descriptor.session_key = "key-1".into();
        descriptor
    }

    fn running(duration: u64) -> SessionController {
        let mut controller = SessionController::new(
            descriptor(duration, false),
            SessionStats::default(),
            SessionRules::default(),
            None,
        );
        controller.initialize(None, t0());
        controller
    }

    fn penalties(effects: &[SessionEffect]) -> Vec<(u64, PenaltySource)> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                SessionEffect::ReportPenalty { report, source } => {
                    Some((report.duration_minutes, *source))
                }
                _ => None,
            })
            .collect()
    }

    fn notices(effects: &[SessionEffect]) -> Vec<Notice> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                SessionEffect::ShowNotice { notice, .. } => Some(notice.clone()),
                _ => None,
            })
            .collect()
    }

    fn summary(effects: &[SessionEffect]) -> Option<SessionSummary> {
        effects.iter().find_map(|effect| match effect {
            SessionEffect::Finished(summary) => Some(summary.clone()),
            _ => None,
        })
    }

    #[test]
    fn remaining_follows_wall_clock_regardless_of_tick_count() {
        let mut controller = running(3600);

        controller.handle(SessionEvent::Tick, at(1));
        controller.handle(SessionEvent::Tick, at(1234));

        assert_eq!(controller.timer().remaining, 3600 - 1234);
        assert_eq!(controller.stats().completed_percent, 34);
        assert_eq!(controller.progress(at(1800)), (1800, 1800, 50));
    }

    #[test]
    fn sixty_second_session_ends_after_sixty_ticks() {
        let mut controller = running(60);
        let mut finished = None;

        for second in 1..=60 {
            let effects = controller.handle(SessionEvent::Tick, at(second));
            if let Some(summary) = summary(&effects) {
                finished = Some((second, summary));
            }
        }

        let (second, summary) = finished.expect("session should finish");
        assert_eq!(second, 60);
        assert_eq!(summary.completed_percent, 100);
        assert_eq!(summary.reason, FinishReason::Completed);
        assert_eq!(controller.phase(), SessionPhase::Ended);
    }

    #[test]
    fn background_seventy_seconds_is_one_violation_and_one_penalty_minute() {
        let mut controller = running(3600);
        controller.handle(SessionEvent::Tick, at(10));

        let bg = controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Background), at(10));
        assert!(bg
            .iter()
            .any(|e| matches!(e, SessionEffect::ScheduleNotification { .. })));
        assert_eq!(controller.phase(), SessionPhase::Backgrounded);

        for second in 11..80 {
            assert!(controller.handle(SessionEvent::Tick, at(second)).is_empty());
        }
        let fg = controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Active), at(80));

        let stats = controller.stats();
        assert_eq!(stats.background_exit_count, 1);
        assert_eq!(stats.violation_count, 1);
        assert_eq!(stats.total_background_time, 70);
        assert_eq!(penalties(&fg), vec![(1, PenaltySource::Background)]);
        assert_eq!(notices(&fg), vec![Notice::AwayTooLong { secs: 70 }]);
        assert!(fg.contains(&SessionEffect::EnsureTicker));
        assert_eq!(controller.phase(), SessionPhase::Running);
    }

    #[test]
    fn short_background_counts_exit_without_violation_or_penalty() {
        let mut controller = running(3600);

        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Inactive), at(100));
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Background), at(101));
        let fg = controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Active), at(130));

        assert_eq!(controller.stats().background_exit_count, 1);
        assert_eq!(controller.stats().violation_count, 0);
        assert_eq!(controller.stats().total_background_time, 30);
        assert!(penalties(&fg).is_empty());
        assert!(notices(&fg).is_empty());
    }

    #[test]
    fn foreground_without_background_is_a_no_op() {
        let mut controller = running(3600);
        let effects = controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Active), at(5));
        assert!(effects.is_empty());
        assert_eq!(controller.stats().background_exit_count, 0);
    }

    #[test]
    fn milestones_fire_once_each() {
        let mut controller = running(100);
        let mut seen = Vec::new();

        for second in 1..100 {
            let effects = controller.handle(SessionEvent::Tick, at(second));
            seen.extend(notices(&effects));
            // Re-delivering the same tick must not repeat a prompt.
            seen.extend(notices(&controller.handle(SessionEvent::Tick, at(second))));
        }

        let milestones: Vec<_> = seen
            .into_iter()
            .filter(|n| matches!(n, Notice::Milestone { .. }))
            .collect();
        assert_eq!(
            milestones,
            vec![
                Notice::Milestone { percent: 20 },
                Notice::Milestone { percent: 40 },
                Notice::Milestone { percent: 60 },
                Notice::Milestone { percent: 80 },
            ]
        );
    }

    #[test]
    fn milestones_skipped_while_away_collapse_into_one_prompt() {
        let mut controller = running(100);
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Background), at(5));
        let fg = controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Active), at(65));

        let milestones: Vec<_> = notices(&fg)
            .into_iter()
            .filter(|n| matches!(n, Notice::Milestone { .. }))
            .collect();
        assert_eq!(milestones, vec![Notice::Milestone { percent: 60 }]);
    }

    fn warnings(effects: &[SessionEffect]) -> Vec<Notice> {
        notices(effects)
            .into_iter()
            .filter(|n| matches!(n, Notice::TimeWarning { .. }))
            .collect()
    }

    #[test]
    fn time_warnings_fire_once_on_crossing_even_when_seconds_are_skipped() {
        let mut controller = running(600);

        assert!(warnings(&controller.handle(SessionEvent::Tick, at(419))).is_empty());

        // Remaining jumps from 181 straight to 178.
        let crossed = controller.handle(SessionEvent::Tick, at(422));
        assert_eq!(
            warnings(&crossed),
            vec![Notice::TimeWarning { remaining_secs: 180 }]
        );
        assert!(warnings(&controller.handle(SessionEvent::Tick, at(423))).is_empty());

        let one_minute = controller.handle(SessionEvent::Tick, at(540));
        assert_eq!(
            warnings(&one_minute),
            vec![Notice::TimeWarning { remaining_secs: 60 }]
        );
    }

    #[test]
    fn short_sessions_never_cross_the_three_minute_warning() {
        let mut controller = running(120);
        let mut seen = Vec::new();
        for second in 1..120 {
            seen.extend(warnings(&controller.handle(SessionEvent::Tick, at(second))));
        }
        assert_eq!(seen, vec![Notice::TimeWarning { remaining_secs: 60 }]);
    }

    #[test]
    fn relaunch_marker_is_accounted_like_a_background_interval() {
        let mut controller = SessionController::new(
            descriptor(3600, false),
            SessionStats::default(),
            SessionRules::default(),
            None,
        );

        let effects = controller.initialize(Some(at(100)), at(250));

        assert_eq!(controller.stats().background_exit_count, 1);
        assert_eq!(controller.stats().violation_count, 1);
        assert_eq!(controller.stats().total_background_time, 150);
        assert_eq!(penalties(&effects), vec![(2, PenaltySource::Background)]);
        assert!(effects.contains(&SessionEffect::ClearLastActive));
    }

    #[test]
    fn stale_or_future_markers_are_ignored() {
        for marker in [at(-10), at(500)] {
            let mut controller = SessionController::new(
                descriptor(3600, false),
                SessionStats::default(),
                SessionRules::default(),
                None,
            );
            let effects = controller.initialize(Some(marker), at(400));
            assert_eq!(controller.stats().background_exit_count, 0);
            assert!(effects.contains(&SessionEffect::ClearLastActive));
        }

        let long = descriptor(200_000, false);
        let mut controller = SessionController::new(
            long,
            SessionStats::default(),
            SessionRules::default(),
            None,
        );
        controller.initialize(Some(at(10)), at(10 + 25 * 3600));
        assert_eq!(controller.stats().total_background_time, 0);
    }

    #[test]
    fn first_resume_during_relaunch_is_not_double_counted() {
        let mut controller = SessionController::new(
            descriptor(3600, false),
            SessionStats::default(),
            SessionRules::default(),
            None,
        );
        controller.initialize(Some(at(100)), at(200));
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Inactive), at(201));
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Active), at(202));
        assert_eq!(controller.stats().background_exit_count, 1);

        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Background), at(300));
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Active), at(310));
        assert_eq!(controller.stats().background_exit_count, 2);
    }

    #[test]
    fn later_background_after_relaunch_still_counts() {
        let mut controller = SessionController::new(
            descriptor(3600, false),
            SessionStats::default(),
            SessionRules::default(),
            None,
        );
        controller.initialize(Some(at(100)), at(200));
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Background), at(900));
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Active), at(1000));

        assert_eq!(controller.stats().background_exit_count, 2);
        assert_eq!(controller.stats().total_background_time, 200);
    }

    #[test]
    fn background_time_is_clamped_to_session_end() {
        let mut controller = running(120);
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Background), at(100));
        let fg = controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Active), at(400));

        assert_eq!(controller.stats().total_background_time, 20);
        let summary = summary(&fg).expect("expired while away");
        assert_eq!(summary.out_of_app_secs, 20);
        assert_eq!(summary.in_app_secs, 100);
        assert_eq!(summary.completed_percent, 100);
    }

    #[test]
    fn end_early_requests_remote_call_then_clears_session() {
        let mut controller = running(3600);
        let effects = controller.handle(SessionEvent::EndEarlyConfirmed, at(900));

        assert_eq!(
            effects.first(),
            Some(&SessionEffect::EndEarlyRemote {
                session_id: "srv-1".into()
            })
        );
        assert!(effects.contains(&SessionEffect::StopTicker));
        assert!(effects.contains(&SessionEffect::ClearSession {
            session_key: "key-1".into()
        }));
        let summary = summary(&effects).unwrap();
        assert_eq!(summary.reason, FinishReason::EndedEarly);
        assert_eq!(summary.completed_percent, 25);
        assert_eq!(summary.studied_secs, 900);
    }

    #[test]
    fn ended_is_terminal() {
        let mut controller = running(3600);
        controller.handle(SessionEvent::EndEarlyConfirmed, at(10));

        assert!(controller.handle(SessionEvent::Tick, at(11)).is_empty());
        assert!(controller
            .handle(SessionEvent::Lifecycle(AppLifecycleState::Background), at(12))
            .is_empty());
        assert!(controller.handle(SessionEvent::EndEarlyConfirmed, at(13)).is_empty());
        assert!(!controller.intercepts_back());
    }

    #[test]
    fn events_before_initialize_are_dropped() {
        let mut controller = SessionController::new(
            descriptor(60, false),
            SessionStats::default(),
            SessionRules::default(),
            None,
        );
        assert!(controller.handle(SessionEvent::Tick, at(1)).is_empty());
        assert_eq!(controller.phase(), SessionPhase::Loading);
        assert!(controller.intercepts_back());
    }

    #[test]
    fn resumed_stats_keep_accumulating() {
        let previous = SessionStats {
            total_background_time: 40,
            background_exit_count: 2,
            ..SessionStats::default()
        };
        let mut controller = SessionController::new(
            descriptor(3600, false),
            previous,
            SessionRules::default(),
            None,
        );
        controller.initialize(None, at(500));
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Background), at(600));
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Active), at(610));

        assert_eq!(controller.stats().total_background_time, 50);
        assert_eq!(controller.stats().background_exit_count, 3);
    }

    fn monitored() -> SessionController {
        let settings = PresenceSettings::default();
        let mut controller = SessionController::new(
            descriptor(3600, true),
            SessionStats::default(),
            SessionRules::default(),
            Some(&settings),
        );
        let effects = controller.initialize(None, t0());
        assert!(effects.contains(&SessionEffect::ConnectPresence));
        controller.handle(SessionEvent::Presence(PresenceSignal::Connected), t0());
        controller
    }

    fn message(text: &str) -> SessionEvent {
        SessionEvent::Presence(PresenceSignal::Message(text.into()))
    }

    #[test]
    fn ninety_seconds_absent_reports_one_minute() {
        let mut controller = monitored();

        controller.handle(message("no_person"), at(10));
        let effects = controller.handle(message("person_detected"), at(100));

        assert_eq!(penalties(&effects), vec![(1, PenaltySource::Absence)]);
        assert_eq!(notices(&effects), vec![Notice::AbsentTooLong { secs: 90 }]);
        let presence = controller.snapshot(at(100)).presence.unwrap();
        assert_eq!(presence.absent_since, None);
        assert_eq!(presence.absent_time, 90);
        assert_eq!(controller.stats().total_background_time, 0);
    }

    #[test]
    fn short_absence_is_not_penalised() {
        let mut controller = monitored();
        controller.handle(message("no_person"), at(10));
        let effects = controller.handle(message("person_detected"), at(40));
        assert!(effects.is_empty());
    }

    #[test]
    fn finalize_flushes_open_absence() {
        let mut controller = monitored();
        controller.handle(message("no_person"), at(10));

        let effects = controller.handle(SessionEvent::EndEarlyConfirmed, at(200));

        assert_eq!(penalties(&effects), vec![(3, PenaltySource::Absence)]);
        assert!(effects.contains(&SessionEffect::DisconnectPresence));
    }

    #[test]
    fn disabling_monitoring_flushes_and_stops_listening() {
        let mut controller = monitored();
        controller.handle(message("no_person"), at(10));

        let effects = controller.handle(SessionEvent::DisablePresence, at(130));
        assert_eq!(penalties(&effects), vec![(2, PenaltySource::Absence)]);
        assert!(!controller.presence_enabled());
        assert!(controller.handle(message("no_person"), at(140)).is_empty());
    }

    #[test]
    fn backgrounding_tears_down_and_foreground_reconnects() {
        let mut controller = monitored();
        controller.handle(message("no_person"), at(10));

        let bg = controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Background), at(80));
        assert_eq!(penalties(&bg), vec![(1, PenaltySource::Absence)]);
        assert!(bg.contains(&SessionEffect::DisconnectPresence));

        // Messages from the torn-down socket are ignored.
        controller.handle(SessionEvent::Presence(PresenceSignal::Connected), at(81));
        assert!(controller.handle(message("no_person"), at(82)).is_empty());

        let fg = controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Active), at(90));
        assert!(fg.contains(&SessionEffect::ConnectPresence));
        let presence = controller.snapshot(at(90)).presence.unwrap();
        assert_eq!(presence.link, PresenceLinkState::Connecting);
    }

    #[test]
    fn late_disconnect_from_previous_socket_does_not_stick() {
        let mut controller = monitored();
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Background), at(20));
        controller.handle(SessionEvent::Lifecycle(AppLifecycleState::Active), at(25));

        controller.handle(SessionEvent::Presence(PresenceSignal::Disconnected), at(26));
        controller.handle(SessionEvent::Presence(PresenceSignal::Connected), at(27));
        controller.handle(message("no_person"), at(30));

        let presence = controller.snapshot(at(30)).presence.unwrap();
        assert_eq!(presence.link, PresenceLinkState::Connected);
        assert_eq!(presence.absent_since, Some(at(30)));
    }

    #[test]
    fn monitoring_requires_ai_flag() {
        let settings = PresenceSettings::default();
        let controller = SessionController::new(
            descriptor(3600, false),
            SessionStats::default(),
            SessionRules::default(),
            Some(&settings),
        );
        assert!(!controller.presence_enabled());
    }
}
