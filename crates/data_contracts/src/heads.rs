use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::detection::ContractError;

/// Named prediction target of the detector.
///
/// Variant order is the loss-reporting order; `BTreeMap<Head, _>` iterates in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Head {
    Hm,
    Wh,
    Reg,
    Ltrb,
    Hps,
    HmHp,
    HpOffset,
    Dep,
    DepSec,
    Dim,
    Rot,
    RotSec,
    AmodelOffset,
    LtrbAmodal,
    Tracking,
    NuscenesAtt,
    Velocity,
}

pub const LOSS_ORDER: [Head; 17] = [
    Head::Hm,
    Head::Wh,
    Head::Reg,
    Head::Ltrb,
    Head::Hps,
    Head::HmHp,
    Head::HpOffset,
    Head::Dep,
    Head::DepSec,
    Head::Dim,
    Head::Rot,
    Head::RotSec,
    Head::AmodelOffset,
    Head::LtrbAmodal,
    Head::Tracking,
    Head::NuscenesAtt,
    Head::Velocity,
];

/// Heads trained with the masked weighted L1 criterion.
pub const REGRESSION_HEADS: [Head; 9] = [
    Head::Reg,
    Head::Wh,
    Head::Tracking,
    Head::Ltrb,
    Head::LtrbAmodal,
    Head::Hps,
    Head::Dim,
    Head::AmodelOffset,
    Head::Velocity,
];

impl Head {
    pub fn as_str(&self) -> &'static str {
        match self {
            Head::Hm => "hm",
            Head::Wh => "wh",
            Head::Reg => "reg",
            Head::Ltrb => "ltrb",
            Head::Hps => "hps",
            Head::HmHp => "hm_hp",
            Head::HpOffset => "hp_offset",
            Head::Dep => "dep",
            Head::DepSec => "dep_sec",
            Head::Dim => "dim",
            Head::Rot => "rot",
            Head::RotSec => "rot_sec",
            Head::AmodelOffset => "amodel_offset",
            Head::LtrbAmodal => "ltrb_amodal",
            Head::Tracking => "tracking",
            Head::NuscenesAtt => "nuscenes_att",
            Head::Velocity => "velocity",
        }
    }

    pub fn is_regression(&self) -> bool {
        REGRESSION_HEADS.contains(self)
    }

    /// Output channels a head predicts for `num_classes` object classes and `num_joints` keypoints.
    pub fn channels(&self, num_classes: usize, num_joints: usize) -> usize {
        match self {
            Head::Hm => num_classes,
            Head::Wh | Head::Reg | Head::Tracking | Head::AmodelOffset | Head::HpOffset => 2,
            Head::Ltrb | Head::LtrbAmodal => 4,
            Head::Hps => num_joints * 2,
            Head::HmHp => num_joints,
            Head::Dep | Head::DepSec => 1,
            Head::Dim | Head::Velocity => 3,
            Head::Rot | Head::RotSec | Head::NuscenesAtt => 8,
        }
    }

    /// Loss weight used when a config does not name one.
    pub fn default_weight(&self) -> f32 {
        match self {
            Head::Wh | Head::Ltrb | Head::LtrbAmodal => 0.1,
            _ => 1.0,
        }
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Head {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LOSS_ORDER
            .iter()
            .copied()
            .find(|h| h.as_str() == s)
            .ok_or_else(|| ContractError::UnknownHead(s.to_string()))
    }
}

/// Per-head loss weights; heads without an entry fall back to [`Head::default_weight`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeadWeights(BTreeMap<Head, f32>);

impl HeadWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, head: Head, weight: f32) -> Self {
        self.0.insert(head, weight);
        self
    }

    pub fn set(&mut self, head: Head, weight: f32) {
        self.0.insert(head, weight);
    }

    pub fn weight(&self, head: Head) -> f32 {
        self.0
            .get(&head)
            .copied()
            .unwrap_or_else(|| head.default_weight())
    }
}

impl FromIterator<(Head, f32)> for HeadWeights {
    fn from_iter<T: IntoIterator<Item = (Head, f32)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_names_round_trip_through_from_str() {
        for head in LOSS_ORDER {
            assert_eq!(head.as_str().parse::<Head>().unwrap(), head);
        }
        assert!("bogus".parse::<Head>().is_err());
    }

    #[test]
    fn btree_order_matches_loss_order() {
        let mut sorted = LOSS_ORDER.to_vec();
        sorted.sort();
        assert_eq!(sorted, LOSS_ORDER.to_vec());
    }

    #[test]
    fn weights_fall_back_to_defaults() {
        let w = HeadWeights::new().with(Head::Hm, 2.0);
        assert_eq!(w.weight(Head::Hm), 2.0);
        assert_eq!(w.weight(Head::Wh), 0.1);
        assert_eq!(w.weight(Head::Dim), 1.0);
    }

    #[test]
    fn weights_deserialize_from_snake_case_keys() {
        let w: HeadWeights = serde_json::from_str(r#"{"dep_sec": 0.5, "rot": 0.0}"#).unwrap();
        assert_eq!(w.weight(Head::DepSec), 0.5);
        assert_eq!(w.weight(Head::Rot), 0.0);
    }
}
