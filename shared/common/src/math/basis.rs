use crate::Vector3;

/// Principal axis of a coordinate basis
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BasisAxis {
    PositiveX,
    PositiveY,
    PositiveZ,
    NegativeX,
    NegativeY,
    NegativeZ,
}

impl BasisAxis {
    pub fn as_vector(self) -> Vector3 {
        match self {
            BasisAxis::PositiveX => Vector3::new(1.0, 0.0, 0.0),
            BasisAxis::PositiveY => Vector3::new(0.0, 1.0, 0.0),
            BasisAxis::PositiveZ => Vector3::new(0.0, 0.0, 1.0),
            BasisAxis::NegativeX => Vector3::new(-1.0, 0.0, 0.0),
            BasisAxis::NegativeY => Vector3::new(0.0, -1.0, 0.0),
            BasisAxis::NegativeZ => Vector3::new(0.0, 0.0, -1.0),
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            BasisAxis::PositiveX => BasisAxis::NegativeX,
            BasisAxis::PositiveY => BasisAxis::NegativeY,
            BasisAxis::PositiveZ => BasisAxis::NegativeZ,
            BasisAxis::NegativeX => BasisAxis::PositiveX,
            BasisAxis::NegativeY => BasisAxis::PositiveY,
            BasisAxis::NegativeZ => BasisAxis::PositiveZ,
        }
    }
}
