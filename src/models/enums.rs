use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(Severity {
    Critical => "critical",
    Urgent => "urgent",
    High => "high",
});

impl Severity {
    /// Clinical urgency rank: higher is more urgent.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 3,
            Self::Urgent => 2,
            Self::High => 1,
        }
    }

    /// Token placed at the front of every alert subject line.
    pub fn subject_prefix(&self) -> &'static str {
        match self {
            Self::Critical => "[CRITICAL]",
            Self::Urgent => "[URGENT]",
            Self::High => "[HIGH]",
        }
    }
}

str_enum!(FindingCategory {
    Vascular => "vascular",
    Neurological => "neurological",
    Cardiac => "cardiac",
    Respiratory => "respiratory",
    Abdominal => "abdominal",
    Oncologic => "oncologic",
    Infectious => "infectious",
    Other => "other",
});

str_enum!(NotificationStatus {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
    Read => "read",
    Acknowledged => "acknowledged",
    Escalated => "escalated",
});

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 6] = [
        Self::Pending,
        Self::Sent,
        Self::Failed,
        Self::Read,
        Self::Acknowledged,
        Self::Escalated,
    ];

    /// No further transition is possible from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Escalated)
    }
}

str_enum!(Role {
    Doctor => "doctor",
    Radiologist => "radiologist",
    Admin => "admin",
});

str_enum!(AuditAction {
    Created => "created",
    Refreshed => "refreshed",
    DeliveryFailed => "delivery_failed",
    Sent => "sent",
    Failed => "failed",
    Read => "read",
    Acknowledged => "acknowledged",
    Escalated => "escalated",
    Retried => "retried",
    Suppressed => "suppressed",
    ReportDeleted => "report_deleted",
});

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn severity_round_trips_through_str() {
        for sev in [Severity::Critical, Severity::Urgent, Severity::High] {
            assert_eq!(Severity::from_str(sev.as_str()).unwrap(), sev);
        }
    }

    #[test]
    fn severity_rank_orders_by_urgency() {
        assert!(Severity::Critical.rank() > Severity::Urgent.rank());
        assert!(Severity::Urgent.rank() > Severity::High.rank());
    }

    #[test]
    fn unknown_status_is_invalid_enum() {
        let err = NotificationStatus::from_str("delivered").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidEnum { .. }));
    }

    #[test]
    fn serde_uses_snake_case_values() {
        let json = serde_json::to_string(&FindingCategory::Neurological).unwrap();
        assert_eq!(json, "\"neurological\"");
        let role: Role = serde_json::from_str("\"radiologist\"").unwrap();
        assert_eq!(role, Role::Radiologist);
        let action = serde_json::to_string(&AuditAction::DeliveryFailed).unwrap();
        assert_eq!(action, "\"delivery_failed\"");
    }

    #[test]
    fn terminal_states() {
        assert!(NotificationStatus::Acknowledged.is_terminal());
        assert!(NotificationStatus::Escalated.is_terminal());
        assert!(!NotificationStatus::Failed.is_terminal());
        assert!(!NotificationStatus::Pending.is_terminal());
    }
}
