//! Key bindings for the lunch room.

use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use super::app::App;

/// What a key press asks the app to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Leave the demo.
    Quit,
    /// Take participant `n` (1-indexed) offline, or bring it back.
    Toggle(usize),
    /// Move the cursor to the next participant.
    SelectNext,
    /// Move the cursor to the previous participant.
    SelectPrev,
    /// Toggle the participant under the cursor.
    ToggleSelected,
}

/// Maps a key press to an action.
pub fn action_for(key: KeyEvent) -> Option<Action> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => Some(Action::Quit),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::Quit),
        KeyCode::Char(digit @ '1'..='9') => digit.to_digit(10).map(|n| Action::Toggle(n as usize)),
        KeyCode::Right | KeyCode::Down | KeyCode::Tab => Some(Action::SelectNext),
        KeyCode::Left | KeyCode::Up | KeyCode::BackTab => Some(Action::SelectPrev),
        KeyCode::Char(' ') | KeyCode::Enter => Some(Action::ToggleSelected),
        _ => None,
    }
}

/// Applies a terminal event to the app. Returns true if it was bound.
pub fn handle_event(app: &mut App, event: Event) -> bool {
    let Event::Key(key) = event else { return false };
    let Some(action) = action_for(key) else { return false };
    app.apply(action);
    true
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::quit(KeyCode::Char('q'), KeyModifiers::NONE, Some(Action::Quit))]
    #[case::escape(KeyCode::Esc, KeyModifiers::NONE, Some(Action::Quit))]
    #[case::ctrl_c(KeyCode::Char('c'), KeyModifiers::CONTROL, Some(Action::Quit))]
    #[case::plain_c(KeyCode::Char('c'), KeyModifiers::NONE, None)]
    #[case::digit(KeyCode::Char('3'), KeyModifiers::NONE, Some(Action::Toggle(3)))]
    #[case::zero(KeyCode::Char('0'), KeyModifiers::NONE, None)]
    #[case::right(KeyCode::Right, KeyModifiers::NONE, Some(Action::SelectNext))]
    #[case::back_tab(KeyCode::BackTab, KeyModifiers::SHIFT, Some(Action::SelectPrev))]
    #[case::space(KeyCode::Char(' '), KeyModifiers::NONE, Some(Action::ToggleSelected))]
    fn test_action_for(
        #[case] code: KeyCode,
        #[case] modifiers: KeyModifiers,
        #[case] expected: Option<Action>,
    ) {
        assert_eq!(action_for(KeyEvent::new(code, modifiers)), expected);
    }

    #[test]
    fn test_release_is_ignored() {
        let mut key = KeyEvent::new(KeyCode::Char('q'), KeyModifiers::NONE);
        key.kind = KeyEventKind::Release;
        assert_eq!(action_for(key), None);
    }
}
