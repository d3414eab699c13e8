//! The per-service incident state machine.
//!
//! Evaluations feed in one at a time (one per processed result). Two
//! consecutive non-up evaluations make a candidate; the third opens an
//! incident in `investigating`. Three consecutive up evaluations resolve
//! it. Operators may advance the open incident manually through the API;
//! `resolved` is terminal and a recurrence opens a fresh incident.

use chrono::{DateTime, Utc};
use guardant_core::{Incident, IncidentState, ProbeStatus, Severity};
use uuid::Uuid;

const OPEN_AFTER_CONSECUTIVE: u32 = 3;
const RESOLVE_AFTER_CONSECUTIVE: u32 = 3;

/// What an evaluation step decided.
#[derive(Debug, Clone, PartialEq)]
pub enum IncidentEvent {
    None,
    Opened(Incident),
    Resolved(Uuid),
}

#[derive(Debug, Default, Clone)]
pub struct IncidentTracker {
    non_up_streak: u32,
    up_streak: u32,
    open_incident: Option<Uuid>,
}

impl IncidentTracker {
    pub fn open_incident(&self) -> Option<Uuid> {
        self.open_incident
    }

    /// Reattach to an incident restored from the store.
    pub fn attach(&mut self, incident_id: Uuid) {
        self.open_incident = Some(incident_id);
    }

    /// An operator resolved the incident out-of-band.
    pub fn detach(&mut self) {
        self.open_incident = None;
        self.non_up_streak = 0;
    }

    pub fn evaluate(
        &mut self,
        nest_id: Uuid,
        service_id: Uuid,
        status: ProbeStatus,
        all_regions_down: bool,
        at: DateTime<Utc>,
    ) -> IncidentEvent {
        match status {
            ProbeStatus::Up => {
                self.non_up_streak = 0;
                self.up_streak += 1;
                if self.up_streak >= RESOLVE_AFTER_CONSECUTIVE {
                    if let Some(incident_id) = self.open_incident.take() {
                        return IncidentEvent::Resolved(incident_id);
                    }
                }
                IncidentEvent::None
            }
            ProbeStatus::Down | ProbeStatus::Degraded => {
                self.up_streak = 0;
                self.non_up_streak += 1;
                if self.non_up_streak >= OPEN_AFTER_CONSECUTIVE && self.open_incident.is_none() {
                    let severity = if all_regions_down {
                        Severity::Critical
                    } else if status == ProbeStatus::Down {
                        Severity::Major
                    } else {
                        Severity::Minor
                    };
                    let incident = Incident::open(nest_id, service_id, severity, at);
                    self.open_incident = Some(incident.id);
                    return IncidentEvent::Opened(incident);
                }
                IncidentEvent::None
            }
        }
    }
}

/// Apply the automatic resolution path to a stored incident.
pub fn resolve_incident(incident: &mut Incident, at: DateTime<Utc>) -> bool {
    incident.advance(
        IncidentState::Resolved,
        "automatic recovery: sustained up status",
        None,
        at,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_on_third_consecutive_non_up() {
        let mut tracker = IncidentTracker::default();
        let nest = Uuid::new_v4();
        let service = Uuid::new_v4();
        let now = Utc::now();

        assert_eq!(
            tracker.evaluate(nest, service, ProbeStatus::Degraded, false, now),
            IncidentEvent::None
        );
        assert_eq!(
            tracker.evaluate(nest, service, ProbeStatus::Degraded, false, now),
            IncidentEvent::None
        );
        let event = tracker.evaluate(nest, service, ProbeStatus::Degraded, false, now);
        let IncidentEvent::Opened(incident) = event else {
            panic!("expected an opened incident");
        };
        assert_eq!(incident.state, IncidentState::Investigating);
        assert_eq!(incident.severity, Severity::Minor);
        assert_eq!(tracker.open_incident(), Some(incident.id));
    }

    #[test]
    fn up_interrupts_the_streak() {
        let mut tracker = IncidentTracker::default();
        let nest = Uuid::new_v4();
        let service = Uuid::new_v4();
        let now = Utc::now();

        tracker.evaluate(nest, service, ProbeStatus::Down, false, now);
        tracker.evaluate(nest, service, ProbeStatus::Up, false, now);
        tracker.evaluate(nest, service, ProbeStatus::Down, false, now);
        assert_eq!(
            tracker.evaluate(nest, service, ProbeStatus::Down, false, now),
            IncidentEvent::None
        );
    }

    #[test]
    fn resolves_after_three_ups_and_reopens_fresh() {
        let mut tracker = IncidentTracker::default();
        let nest = Uuid::new_v4();
        let service = Uuid::new_v4();
        let now = Utc::now();

        for _ in 0..3 {
            tracker.evaluate(nest, service, ProbeStatus::Down, true, now);
        }
        let first_id = tracker.open_incident().unwrap();

        tracker.evaluate(nest, service, ProbeStatus::Up, false, now);
        tracker.evaluate(nest, service, ProbeStatus::Up, false, now);
        assert_eq!(
            tracker.evaluate(nest, service, ProbeStatus::Up, false, now),
            IncidentEvent::Resolved(first_id)
        );

        // A new outage opens a distinct incident.
        for _ in 0..2 {
            tracker.evaluate(nest, service, ProbeStatus::Down, false, now);
        }
        let IncidentEvent::Opened(second) =
            tracker.evaluate(nest, service, ProbeStatus::Down, false, now)
        else {
            panic!("expected reopened incident");
        };
        assert_ne!(second.id, first_id);
    }

    #[test]
    fn severity_reflects_scope() {
        let mut tracker = IncidentTracker::default();
        let now = Utc::now();
        for _ in 0..2 {
            tracker.evaluate(Uuid::nil(), Uuid::nil(), ProbeStatus::Down, true, now);
        }
        let IncidentEvent::Opened(incident) =
            tracker.evaluate(Uuid::nil(), Uuid::nil(), ProbeStatus::Down, true, now)
        else {
            panic!("expected incident");
        };
        assert_eq!(incident.severity, Severity::Critical);
    }
}
