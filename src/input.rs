// Keyboard and mouse state, owned by the event loop
//
// Passed by reference to whoever needs it instead of living in statics.

use std::collections::HashSet;
use winit::event::{ElementState, MouseButton};
use winit::keyboard::KeyCode;

#[derive(Debug, Default)]
pub struct InputState {
    keys_down: HashSet<KeyCode>,
    keys_pressed: HashSet<KeyCode>,
    buttons_down: HashSet<MouseButton>,
    cursor: Option<glam::Vec2>,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_event(&mut self, key: KeyCode, state: ElementState) {
        match state {
            ElementState::Pressed => self.press(key),
            ElementState::Released => self.release(key),
        }
    }

    pub fn press(&mut self, key: KeyCode) {
        // Key repeat doesn't count as a fresh press
        if self.keys_down.insert(key) {
            self.keys_pressed.insert(key);
        }
    }

    pub fn release(&mut self, key: KeyCode) {
        self.keys_down.remove(&key);
    }

    pub fn is_down(&self, key: KeyCode) -> bool {
        self.keys_down.contains(&key)
    }

    /// Went down since the last `end_frame`.
    pub fn was_pressed(&self, key: KeyCode) -> bool {
        self.keys_pressed.contains(&key)
    }

    pub fn mouse_button(&mut self, button: MouseButton, state: ElementState) {
        match state {
            ElementState::Pressed => {
                self.buttons_down.insert(button);
            }
            ElementState::Released => {
                self.buttons_down.remove(&button);
            }
        }
    }

    pub fn is_button_down(&self, button: MouseButton) -> bool {
        self.buttons_down.contains(&button)
    }

    pub fn set_cursor(&mut self, x: f32, y: f32) {
        self.cursor = Some(glam::Vec2::new(x, y));
    }

    pub fn cursor(&self) -> Option<glam::Vec2> {
        self.cursor
    }

    /// Focus loss: nothing is held any more.
    pub fn clear(&mut self) {
        self.keys_down.clear();
        self.keys_pressed.clear();
        self.buttons_down.clear();
    }

    pub fn end_frame(&mut self) {
        self.keys_pressed.clear();
    }
}

/// Key names as written in config.toml.
pub fn parse_key(name: &str) -> Option<KeyCode> {
    let name = name.trim();
    if name.len() == 1 {
        let c = name.chars().next()?.to_ascii_uppercase();
        return match c {
            'A' => Some(KeyCode::KeyA),
            'B' => Some(KeyCode::KeyB),
            'C' => Some(KeyCode::KeyC),
            'D' => Some(KeyCode::KeyD),
            'E' => Some(KeyCode::KeyE),
            'F' => Some(KeyCode::KeyF),
            'G' => Some(KeyCode::KeyG),
            'H' => Some(KeyCode::KeyH),
            'I' => Some(KeyCode::KeyI),
            'J' => Some(KeyCode::KeyJ),
            'K' => Some(KeyCode::KeyK),
            'L' => Some(KeyCode::KeyL),
            'M' => Some(KeyCode::KeyM),
            'N' => Some(KeyCode::KeyN),
            'O' => Some(KeyCode::KeyO),
            'P' => Some(KeyCode::KeyP),
            'Q' => Some(KeyCode::KeyQ),
            'R' => Some(KeyCode::KeyR),
            'S' => Some(KeyCode::KeyS),
            'T' => Some(KeyCode::KeyT),
            'U' => Some(KeyCode::KeyU),
            'V' => Some(KeyCode::KeyV),
            'W' => Some(KeyCode::KeyW),
            'X' => Some(KeyCode::KeyX),
            'Y' => Some(KeyCode::KeyY),
            'Z' => Some(KeyCode::KeyZ),
            '0' => Some(KeyCode::Digit0),
            '1' => Some(KeyCode::Digit1),
            '2' => Some(KeyCode::Digit2),
            '3' => Some(KeyCode::Digit3),
            '4' => Some(KeyCode::Digit4),
            '5' => Some(KeyCode::Digit5),
            '6' => Some(KeyCode::Digit6),
            '7' => Some(KeyCode::Digit7),
            '8' => Some(KeyCode::Digit8),
            '9' => Some(KeyCode::Digit9),
            _ => None,
        };
    }

    match name.to_ascii_lowercase().as_str() {
        "escape" | "esc" => Some(KeyCode::Escape),
        "space" => Some(KeyCode::Space),
        "enter" | "return" => Some(KeyCode::Enter),
        "tab" => Some(KeyCode::Tab),
        "backspace" => Some(KeyCode::Backspace),
        "f1" => Some(KeyCode::F1),
        "f2" => Some(KeyCode::F2),
        "f3" => Some(KeyCode::F3),
        "f4" => Some(KeyCode::F4),
        "f5" => Some(KeyCode::F5),
        "f6" => Some(KeyCode::F6),
        "f7" => Some(KeyCode::F7),
        "f8" => Some(KeyCode::F8),
        "f9" => Some(KeyCode::F9),
        "f10" => Some(KeyCode::F10),
        "f11" => Some(KeyCode::F11),
        "f12" => Some(KeyCode::F12),
        "up" => Some(KeyCode::ArrowUp),
        "down" => Some(KeyCode::ArrowDown),
        "left" => Some(KeyCode::ArrowLeft),
        "right" => Some(KeyCode::ArrowRight),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn press_is_reported_once_per_frame() {
        let mut input = InputState::new();
        input.key_event(KeyCode::KeyV, ElementState::Pressed);
        assert!(input.is_down(KeyCode::KeyV));
        assert!(input.was_pressed(KeyCode::KeyV));

        input.end_frame();
        assert!(input.is_down(KeyCode::KeyV));
        assert!(!input.was_pressed(KeyCode::KeyV));

        // Held key repeating
        input.key_event(KeyCode::KeyV, ElementState::Pressed);
        assert!(!input.was_pressed(KeyCode::KeyV));

        input.key_event(KeyCode::KeyV, ElementState::Released);
        assert!(!input.is_down(KeyCode::KeyV));
    }

    #[test]
    fn clear_drops_held_state() {
        let mut input = InputState::new();
        input.press(KeyCode::Space);
        input.mouse_button(MouseButton::Left, ElementState::Pressed);
        input.clear();
        assert!(!input.is_down(KeyCode::Space));
        assert!(!input.is_button_down(MouseButton::Left));
    }

    #[test]
    fn key_names() {
        assert_eq!(parse_key("Escape"), Some(KeyCode::Escape));
        assert_eq!(parse_key("F11"), Some(KeyCode::F11));
        assert_eq!(parse_key("v"), Some(KeyCode::KeyV));
        assert_eq!(parse_key(" 3 "), Some(KeyCode::Digit3));
        assert_eq!(parse_key("Hyper"), None);
        assert_eq!(parse_key(""), None);
    }
}
