use serde::{Deserialize, Serialize};

use crate::amount::Cogs;
use crate::identity::{Address, GroupId};
use crate::{ChannelError, Result};

/// A service's channel group as published by the service registry.
///
/// Address and group id are optional because registry entries may lack them;
/// such an offer cannot back a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOffer {
    /// Where payments for this group go.
    pub payment_address: Option<Address>,
    pub group_id: Option<GroupId>,
    /// Price of one call, in cogs.
    pub price_per_call: Cogs,
    /// Blocks a channel must remain valid past the current block.
    pub expiration_threshold: u64,
}

impl ServiceOffer {
    pub fn new(
        payment_address: Address,
        group_id: GroupId,
        price_per_call: Cogs,
        expiration_threshold: u64,
    ) -> Self {
        Self {
            payment_address: Some(payment_address),
            group_id: Some(group_id),
            price_per_call,
            expiration_threshold,
        }
    }

    /// The payment address and group id, or `NoUsableServiceOffer`.
    pub fn target(&self) -> Result<(Address, GroupId)> {
        let address = self
            .payment_address
            .filter(|a| !a.is_zero())
            .ok_or_else(|| ChannelError::NoUsableServiceOffer("missing payment address".into()))?;
        let group_id = self
            .group_id
            .ok_or_else(|| ChannelError::NoUsableServiceOffer("missing group id".into()))?;
        if self.price_per_call.is_zero() {
            return Err(ChannelError::NoUsableServiceOffer(
                "price per call must be positive".into(),
            ));
        }
        Ok((address, group_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_without_target_is_unusable() {
        let mut offer = ServiceOffer::new(
            Address::new([0xbb; 20]),
            GroupId::new([1; 32]),
            Cogs::from_u64(5),
            100,
        );
        assert!(offer.target().is_ok());

        offer.group_id = None;
        assert!(matches!(
            offer.target(),
            Err(ChannelError::NoUsableServiceOffer(_))
        ));

        offer.group_id = Some(GroupId::new([1; 32]));
        offer.payment_address = Some(Address::ZERO);
        assert!(matches!(
            offer.target(),
            Err(ChannelError::NoUsableServiceOffer(_))
        ));

        offer.payment_address = Some(Address::new([0xbb; 20]));
        offer.price_per_call = Cogs::zero();
        assert!(matches!(
            offer.target(),
            Err(ChannelError::NoUsableServiceOffer(_))
        ));
    }

    #[test]
    fn offer_parses_from_registry_json() {
        let json = r#"{
            "payment_address": "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            "group_id": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAE=",
            "price_per_call": "5",
            "expiration_threshold": 240
        }"#;
        let offer: ServiceOffer = serde_json::from_str(json).unwrap();
        assert_eq!(offer.price_per_call, Cogs::from_u64(5));
        assert_eq!(offer.expiration_threshold, 240);
        let (address, group_id) = offer.target().unwrap();
        assert_eq!(address, Address::new([0xbb; 20]));
        assert_eq!(group_id.as_bytes()[31], 1);
    }
}
