use serde::{Deserialize, Serialize};
use std::fmt;

/// Controller buttons a remote player can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Button {
    Up,
    Down,
    Left,
    Right,
    A,
    B,
    X,
    Y,
    Select,
    Start,
}

impl Button {
    pub const ALL: [Button; 10] = [
        Button::Up,
        Button::Down,
        Button::Left,
        Button::Right,
        Button::A,
        Button::B,
        Button::X,
        Button::Y,
        Button::Select,
        Button::Start,
    ];

    /// Maps a key name as sent by the remote input layer to a button.
    /// Matching ignores ASCII case; unmapped keys yield `None`.
    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_ascii_lowercase();
        let button = match key.as_str() {
            "arrowup" | "up" => Button::Up,
            "arrowdown" | "down" => Button::Down,
            "arrowleft" | "left" => Button::Left,
            "arrowright" | "right" => Button::Right,
            "a" => Button::A,
            "b" => Button::B,
            "x" => Button::X,
            "y" => Button::Y,
            "select" => Button::Select,
            "start" => Button::Start,
            _ => return None,
        };
        Some(button)
    }

    /// Key names accepted for this button.
    pub fn keys(self) -> &'static [&'static str] {
        match self {
            Button::Up => &["arrowup", "up"],
            Button::Down => &["arrowdown", "down"],
            Button::Left => &["arrowleft", "left"],
            Button::Right => &["arrowright", "right"],
            Button::A => &["a"],
            Button::B => &["b"],
            Button::X => &["x"],
            Button::Y => &["y"],
            Button::Select => &["select"],
            Button::Start => &["start"],
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Button::Up => "up",
            Button::Down => "down",
            Button::Left => "left",
            Button::Right => "right",
            Button::A => "a",
            Button::B => "b",
            Button::X => "x",
            Button::Y => "y",
            Button::Select => "select",
            Button::Start => "start",
        };
        f.write_str(name)
    }
}
