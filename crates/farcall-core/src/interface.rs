//! Compile-time identity of remote interfaces.
//!
//! Each remotable interface gets a marker type implementing [`Interface`].
//! Its [`InterfaceId`] is a name-based UUID, so client and server agree on it
//! without sharing anything but the interface name.

use crate::proxy::Proxy;
use uuid::Uuid;

pub type InterfaceId = Uuid;

const INTERFACE_NAMESPACE: Uuid = Uuid::from_u128(0x9d4b_6f2e_51a3_4c0e_8f17_3a6e_c2d9_b540);

/// Stable id for an interface name.
pub fn interface_id(name: &str) -> InterfaceId {
    Uuid::new_v5(&INTERFACE_NAMESPACE, name.as_bytes())
}

pub trait Interface: 'static {
    /// Fully qualified interface name, e.g. `"demo.Calculator"`.
    const NAME: &'static str;

    /// Typed client-side handle built around an untyped [`Proxy`].
    type Proxy: From<Proxy>;

    fn interface_id() -> InterfaceId {
        interface_id(Self::NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_id_is_stable_per_name() {
        assert_eq!(interface_id("demo.Calculator"), interface_id("demo.Calculator"));
        assert_ne!(interface_id("demo.Calculator"), interface_id("demo.Clock"));
        assert_eq!(interface_id("demo.Calculator").get_version_num(), 5);
    }
}
