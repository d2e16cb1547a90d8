//! Identifier newtypes for the entities the control plane replicates.
//!
//! All identifiers are 64-bit values produced by the deterministic generator
//! in [`crate::idgen`]; zero means "not yet assigned".

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            /// Creates an identifier from a raw u64 value.
            pub fn new(id: u64) -> Self {
                $name(id)
            }

            /// Returns the raw u64 value.
            pub fn as_u64(&self) -> u64 {
                self.0
            }

            /// Returns true when the identifier has not been assigned yet.
            pub fn is_zero(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a farm, the unit of replication and live-state grouping.
    FarmId
);
id_type!(
    /// Identifier of a device within a farm.
    DeviceId
);
id_type!(
    /// Identifier of a user account, derived from the user's email address.
    UserId
);
id_type!(
    /// Identifier of an organization (tenant).
    OrgId
);
id_type!(
    /// Identifier of a role.
    RoleId
);
id_type!(
    /// Identifier of a channel on a device.
    ChannelId
);
id_type!(
    /// Identifier of a metric on a device.
    MetricId
);
