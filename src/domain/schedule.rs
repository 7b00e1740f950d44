use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A busy/open window supplied by the calendar collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub label: String,
}

impl CalendarWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideType {
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOverride {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: OverrideType,
}

impl ScheduleOverride {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.from <= now && now < self.to
    }
}

/// Which calendar windows belong to a queue, by case-insensitive label match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl CalendarFilter {
    pub fn is_relevant(&self, window: &CalendarWindow) -> bool {
        let label = window.label.to_lowercase();
        let has = |term: &String| label.contains(&term.to_lowercase());

        self.include.iter().any(has) && !self.exclude.iter().any(has)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleStatus {
    pub open: bool,
    pub current_window: Option<CalendarWindow>,
    pub next_window: Option<CalendarWindow>,
    pub windows: Vec<CalendarWindow>,
    pub schedule_override: Option<ScheduleOverride>,
}

/// Open/closed gate for one queue.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    filter: CalendarFilter,
    windows: Vec<CalendarWindow>,
    schedule_override: Option<ScheduleOverride>,
}

impl Schedule {
    pub fn new(filter: CalendarFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if let Some(o) = self.schedule_override.as_ref().filter(|o| o.contains(now)) {
            return o.kind == OverrideType::Open;
        }

        self.windows.iter().any(|w| w.contains(now))
    }

    pub fn set_override(&mut self, schedule_override: ScheduleOverride) {
        self.schedule_override = Some(schedule_override);
    }

    pub fn clear_override(&mut self) {
        self.schedule_override = None;
    }

    pub fn schedule_override(&self) -> Option<&ScheduleOverride> {
        self.schedule_override.as_ref()
    }

    /// Keeps only the windows relevant to this queue, ordered by start.
    pub fn set_windows(&mut self, windows: &[CalendarWindow]) {
        let mut relevant: Vec<CalendarWindow> = windows
            .iter()
            .filter(|w| self.filter.is_relevant(w))
            .cloned()
            .collect();
        relevant.sort_by_key(|w| w.start);

        self.windows = relevant;
    }

    pub fn status(&self, now: DateTime<Utc>) -> ScheduleStatus {
        ScheduleStatus {
            open: self.is_open(now),
            current_window: self.windows.iter().find(|w| w.contains(now)).cloned(),
            next_window: self.windows.iter().find(|w| w.start > now).cloned(),
            windows: self.windows.clone(),
            schedule_override: self.schedule_override.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 12, hour, minute, 0).unwrap()
    }

    fn window(start: DateTime<Utc>, end: DateTime<Utc>, label: &str) -> CalendarWindow {
        CalendarWindow {
            start,
            end,
            label: label.to_string(),
        }
    }

    fn bbb() -> Schedule {
        Schedule::new(CalendarFilter {
            include: vec!["bbb".to_string()],
            exclude: vec!["proffice".to_string()],
        })
    }

    #[test]
    fn filter_matches_include_and_not_exclude() {
        let filter = bbb().filter;

        assert!(filter.is_relevant(&window(t(9, 0), t(10, 0), "OH @ BBB")));
        assert!(!filter.is_relevant(&window(t(9, 0), t(10, 0), "BBB Proffice")));
        assert!(!filter.is_relevant(&window(t(9, 0), t(10, 0), "UGLI OH")));
    }

    #[test]
    fn open_override_wins_inside_its_window_only() {
        let mut schedule = bbb();
        let (from, to) = (t(13, 0), t(15, 0));
        schedule.set_override(ScheduleOverride {
            from,
            to,
            kind: OverrideType::Open,
        });

        assert!(schedule.is_open(from));
        assert!(schedule.is_open(t(14, 30)));
        assert!(schedule.is_open(to - Duration::seconds(1)));
        assert!(!schedule.is_open(to));
        assert!(!schedule.is_open(from - Duration::seconds(1)));
    }

    #[test]
    fn close_override_beats_calendar() {
        let mut schedule = bbb();
        schedule.set_windows(&[window(t(10, 0), t(12, 0), "BBB OH")]);
        assert!(schedule.is_open(t(11, 0)));

        schedule.set_override(ScheduleOverride {
            from: t(10, 30),
            to: t(11, 30),
            kind: OverrideType::Close,
        });

        assert!(!schedule.is_open(t(11, 0)));
        assert!(schedule.is_open(t(11, 45)));

        schedule.clear_override();
        schedule.clear_override();
        assert!(schedule.is_open(t(11, 0)));
        assert!(schedule.schedule_override().is_none());
    }

    #[test]
    fn latest_override_replaces_previous() {
        let mut schedule = bbb();
        schedule.set_override(ScheduleOverride {
            from: t(8, 0),
            to: t(9, 0),
            kind: OverrideType::Open,
        });
        schedule.set_override(ScheduleOverride {
            from: t(16, 0),
            to: t(17, 0),
            kind: OverrideType::Open,
        });

        assert!(!schedule.is_open(t(8, 30)));
        assert!(schedule.is_open(t(16, 30)));
    }

    #[test]
    fn status_reports_current_and_next_window() {
        let mut schedule = bbb();
        schedule.set_windows(&[
            window(t(15, 0), t(17, 0), "BBB OH"),
            window(t(10, 0), t(12, 0), "BBB OH"),
            window(t(12, 0), t(13, 0), "UGLI OH"),
        ]);

        let status = schedule.status(t(11, 0));

        assert!(status.open);
        assert_eq!(status.windows.len(), 2);
        assert_eq!(status.current_window.map(|w| w.start), Some(t(10, 0)));
        assert_eq!(status.next_window.map(|w| w.start), Some(t(15, 0)));

        let closed = schedule.status(t(13, 30));
        assert!(!closed.open);
        assert!(closed.current_window.is_none());
    }
}
