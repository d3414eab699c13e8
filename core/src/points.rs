use crate::service::ServiceType;

/// Base award for one successful probe.
pub const BASE_POINTS: f64 = 1.0;
/// Bonus when this worker delivered the first result for its region in the
/// current scheduling cycle.
pub const FIRST_IN_REGION_BONUS: f64 = 0.5;

/// Per-type weighting of successful probes. Heavier strategies earn more.
pub fn type_multiplier(service_type: ServiceType) -> f64 {
    match service_type {
        ServiceType::Web => 1.0,
        ServiceType::Tcp => 1.0,
        ServiceType::Ping => 1.0,
        ServiceType::Port => 0.8,
        ServiceType::Keyword => 1.2,
        ServiceType::Heartbeat => 0.5,
        ServiceType::Github => 1.1,
        ServiceType::UptimeApi => 1.1,
    }
}

/// Points earned for one successful probe.
pub fn award(service_type: ServiceType, first_in_region: bool) -> f64 {
    let mut points = BASE_POINTS * type_multiplier(service_type);
    if first_in_region {
        points += FIRST_IN_REGION_BONUS;
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn award_includes_bonus() {
        assert_eq!(award(ServiceType::Web, false), 1.0);
        assert_eq!(award(ServiceType::Web, true), 1.5);
        assert_eq!(award(ServiceType::Keyword, true), 1.2 + 0.5);
    }
}
