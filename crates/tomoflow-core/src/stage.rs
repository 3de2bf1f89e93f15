use serde::{Deserialize, Serialize};

/// One step of the tilt-series pipeline, in dependency order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    MotionCorrection,
    CtfEstimation,
    Alignment,
    Reconstruction,
}

impl Stage {
    /// All stages in declared dependency order.
    pub const ALL: [Stage; 4] = [
        Stage::MotionCorrection,
        Stage::CtfEstimation,
        Stage::Alignment,
        Stage::Reconstruction,
    ];

    /// Short key used in artifact file names and config section names.
    pub fn key(self) -> &'static str {
        match self {
            Self::MotionCorrection => "motioncorr",
            Self::CtfEstimation => "ctffind",
            Self::Alignment => "align",
            Self::Reconstruction => "recon",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.key() == key)
    }

    /// The stage whose completed units gate entry into this one.
    pub fn predecessor(self) -> Option<Stage> {
        match self {
            Self::MotionCorrection => None,
            Self::CtfEstimation => Some(Self::MotionCorrection),
            Self::Alignment => Some(Self::CtfEstimation),
            Self::Reconstruction => Some(Self::Alignment),
        }
    }

    /// This stage and every stage before it, oldest first.
    pub fn lineage(self) -> Vec<Stage> {
        Self::ALL.into_iter().take_while(|s| *s <= self).collect()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MotionCorrection => write!(f, "Motion correction"),
            Self::CtfEstimation => write!(f, "CTF estimation"),
            Self::Alignment => write!(f, "Alignment"),
            Self::Reconstruction => write!(f, "Reconstruction"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_key(stage.key()), Some(stage));
        }
        assert_eq!(Stage::from_key("bogus"), None);
    }

    #[test]
    fn predecessors_follow_declared_order() {
        assert_eq!(Stage::MotionCorrection.predecessor(), None);
        for pair in Stage::ALL.windows(2) {
            assert_eq!(pair[1].predecessor(), Some(pair[0]));
        }
    }

    #[test]
    fn lineage_includes_self() {
        assert_eq!(
            Stage::CtfEstimation.lineage(),
            vec![Stage::MotionCorrection, Stage::CtfEstimation]
        );
    }
}
