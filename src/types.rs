use serde::{Deserialize, Serialize};

/// Physical axis of the piezo stage, numbered the way the controller counts them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Vertical = 1,
    Horizontal = 2,
}

impl From<Axis> for u8 {
    fn from(axis: Axis) -> Self {
        axis as u8
    }
}

impl TryFrom<u8> for Axis {
    type Error = crate::error::ScanError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Axis::Vertical),
            2 => Ok(Axis::Horizontal),
            _ => Err(crate::error::ScanError::InvalidConfig(format!(
                "Invalid stage axis: {}",
                value
            ))),
        }
    }
}

/// Sign of a step on a piezo axis. The controller keeps separate step
/// amplitudes for each polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarity {
    Negative,
    Positive,
}

impl Polarity {
    pub fn sign(self) -> i64 {
        match self {
            Polarity::Negative => -1,
            Polarity::Positive => 1,
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Polarity::Negative => '-',
            Polarity::Positive => '+',
        }
    }
}

/// One of the four jog identities of the stage, each with its own axis
/// and sign convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JogDirection {
    HorizontalMinus,
    HorizontalPlus,
    VerticalMinus,
    VerticalPlus,
}

impl JogDirection {
    pub const ALL: [JogDirection; 4] = [
        JogDirection::HorizontalMinus,
        JogDirection::HorizontalPlus,
        JogDirection::VerticalMinus,
        JogDirection::VerticalPlus,
    ];

    pub fn axis(self) -> Axis {
        match self {
            JogDirection::HorizontalMinus | JogDirection::HorizontalPlus => Axis::Horizontal,
            JogDirection::VerticalMinus | JogDirection::VerticalPlus => Axis::Vertical,
        }
    }

    pub fn polarity(self) -> Polarity {
        match self {
            JogDirection::HorizontalMinus | JogDirection::VerticalMinus => Polarity::Negative,
            JogDirection::HorizontalPlus | JogDirection::VerticalPlus => Polarity::Positive,
        }
    }

    /// Signed step count for `unit_steps` in this direction
    pub fn signed(self, unit_steps: u32) -> i64 {
        self.polarity().sign() * unit_steps as i64
    }
}

impl std::str::FromStr for JogDirection {
    type Err = crate::error::ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x-" | "horizontal_minus" => Ok(JogDirection::HorizontalMinus),
            "x+" | "horizontal_plus" => Ok(JogDirection::HorizontalPlus),
            "y-" | "vertical_minus" => Ok(JogDirection::VerticalMinus),
            "y+" | "vertical_plus" => Ok(JogDirection::VerticalPlus),
            _ => Err(crate::error::ScanError::InvalidConfig(format!(
                "Unknown jog direction '{}' (expected x-, x+, y- or y+)",
                s
            ))),
        }
    }
}

/// Rotation sense of an angular positioner, encoded as the controller expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationDirection {
    Clockwise = 0,
    CounterClockwise = 1,
}

impl From<RotationDirection> for u8 {
    fn from(direction: RotationDirection) -> Self {
        direction as u8
    }
}

impl std::str::FromStr for RotationDirection {
    type Err = crate::error::ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cw" | "0" => Ok(RotationDirection::Clockwise),
            "ccw" | "1" => Ok(RotationDirection::CounterClockwise),
            _ => Err(crate::error::ScanError::InvalidConfig(format!(
                "Unknown rotation direction '{}' (expected cw or ccw)",
                s
            ))),
        }
    }
}

/// Column traversal order of one raster row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowDirection {
    LeftToRight,
    RightToLeft,
}

impl RowDirection {
    pub fn for_row(row: i32) -> Self {
        if row % 2 == 0 {
            RowDirection::LeftToRight
        } else {
            RowDirection::RightToLeft
        }
    }
}

/// A single intensity reading at one pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelSample {
    pub col: i32,
    pub row: i32,
    pub count: u32,
}

impl PixelSample {
    pub fn new(col: i32, row: i32, count: u32) -> Self {
        Self { col, row, count }
    }
}

/// Pixel sample with the wall-clock time it was taken, as written to the sample log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub frame: u32,
    #[serde(flatten)]
    pub sample: PixelSample,
}
