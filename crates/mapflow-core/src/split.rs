use std::fmt;

use serde::{Deserialize, Serialize};

use crate::settings::SplitSettings;
use crate::types::PointId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subset {
    Training,
    Validation,
    Testing,
}

impl Subset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subset::Training => "training",
            Subset::Validation => "validation",
            Subset::Testing => "testing",
        }
    }
}

impl fmt::Display for Subset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Subset {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "training" => Ok(Subset::Training),
            "validation" => Ok(Subset::Validation),
            "testing" => Ok(Subset::Testing),
            other => Err(format!("unknown subset '{other}'")),
        }
    }
}

/// Position of the id in `[0, 1)`, stable across runs and machines.
fn unit_position(id: &PointId) -> f64 {
    let digest = blake3::hash(id.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_be_bytes(prefix) >> 11) as f64 / (1u64 << 53) as f64
}

/// Testing takes the low end of the unit interval, validation the next band.
pub fn assign_subset(id: &PointId, split: &SplitSettings) -> Subset {
    let position = unit_position(id);
    if position < split.testing {
        Subset::Testing
    } else if position < split.testing + split.validation {
        Subset::Validation
    } else {
        Subset::Training
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_put_everything_in_training() {
        let split = SplitSettings::default();
        for index in 0..100 {
            let id = PointId::derive(index as f64, 0.0, "", 4);
            assert_eq!(assign_subset(&id, &split), Subset::Training);
        }
    }

    #[test]
    fn assignment_is_stable_and_roughly_proportional() {
        let split = SplitSettings {
            validation: 0.2,
            testing: 0.1,
        };
        let ids: Vec<PointId> = (0..2000)
            .map(|index| PointId::derive(index as f64 / 100.0, 5.0, "", 4))
            .collect();

        let first: Vec<Subset> = ids.iter().map(|id| assign_subset(id, &split)).collect();
        let second: Vec<Subset> = ids.iter().map(|id| assign_subset(id, &split)).collect();
        assert_eq!(first, second);

        let testing = first.iter().filter(|s| **s == Subset::Testing).count();
        let validation = first.iter().filter(|s| **s == Subset::Validation).count();
        assert!((100..300).contains(&testing), "testing = {testing}");
        assert!((250..550).contains(&validation), "validation = {validation}");
    }
}
