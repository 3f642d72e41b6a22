use std::fmt;

use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;

/// Macro to generate enum with as_str + std::str::FromStr pattern.
///
/// The `as_str` form is what lands in SQLite; the serde form
/// (SCREAMING_SNAKE_CASE) is what clients see on the wire.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
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

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
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

str_enum!(Role {
    Patient => "patient",
    Doctor => "doctor",
});

str_enum!(AccountStatus {
    PendingVerification => "pending_verification",
    Active => "active",
});

str_enum!(AppointmentStatus {
    Pending => "pending",
    Resolved => "resolved",
    Cancelled => "cancelled",
});

str_enum!(OtpPurpose {
    AccountActivation => "account_activation",
    AppointmentResolution => "appointment_resolution",
});

str_enum!(ChallengeState {
    Live => "live",
    Consumed => "consumed",
    Superseded => "superseded",
    Expired => "expired",
});

str_enum!(MailKind {
    ActivationCode => "activation_code",
    BookingOtp => "booking_otp",
    OtpResend => "otp_resend",
    AppointmentCompleted => "appointment_completed",
    CancelledByDoctor => "cancelled_by_doctor",
    CancelledByPatient => "cancelled_by_patient",
});

impl Role {
    /// The other party of an appointment.
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Patient => Role::Doctor,
            Role::Doctor => Role::Patient,
        }
    }
}

impl AppointmentStatus {
    /// RESOLVED and CANCELLED admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Resolved | AppointmentStatus::Cancelled)
    }
}
