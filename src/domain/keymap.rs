//! Raw button codes per transport and their logical roles.
//!
//! Exactly three codes are meaningful on each transport; anything else a
//! remote sends is ignored by the router.

use crate::domain::models::{LogicalButton, RawCommand, TransportKind};

/// ANT+ generic control command numbers.
pub mod ant {
    pub const MENU_UP: u16 = 0;
    pub const MENU_DOWN: u16 = 1;
    pub const MENU_SELECT: u16 = 2;
    pub const LAP: u16 = 36;
}

/// HID consumer-control usages sent by BLE remotes.
pub mod ble {
    pub const PLAY_PAUSE: u16 = 0x00CD;
    pub const VOLUME_UP: u16 = 0x00E9;
    pub const VOLUME_DOWN: u16 = 0x00EA;
}

const ANT_TABLE: [(u16, LogicalButton); 3] = [
    (ant::MENU_DOWN, LogicalButton::Left),
    (ant::MENU_UP, LogicalButton::Right),
    (ant::LAP, LogicalButton::Up),
];

const BLE_TABLE: [(u16, LogicalButton); 3] = [
    (ble::VOLUME_DOWN, LogicalButton::Left),
    (ble::VOLUME_UP, LogicalButton::Right),
    (ble::PLAY_PAUSE, LogicalButton::Up),
];

fn table(transport: TransportKind) -> &'static [(u16, LogicalButton); 3] {
    match transport {
        TransportKind::Ant => &ANT_TABLE,
        TransportKind::Ble => &BLE_TABLE,
    }
}

pub fn logical_button(command: RawCommand) -> Option<LogicalButton> {
    table(command.transport)
        .iter()
        .find(|(code, _)| *code == command.code)
        .map(|(_, button)| *button)
}

/// Raw command a logical button is expected to arrive as.
pub fn raw_command(transport: TransportKind, button: LogicalButton) -> RawCommand {
    let code = table(transport)
        .iter()
        .find(|(_, candidate)| *candidate == button)
        .map(|(code, _)| *code)
        .unwrap_or_default();
    RawCommand::new(transport, code)
}
