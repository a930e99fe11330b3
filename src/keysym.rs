//! Symbolic key names and X11 keysyms.
//!
//! Single characters map to their code point; everything else goes
//! through the name table. Multi-segment keys like `ctrl-alt-del` are
//! modifier chords.

use crate::{Error, Result};

/// Name table for [`lookup`]. Order matters: the reverse mapping keeps
/// the later alias, so `shift` wins over `lshift` when a recorded
/// session is written back out.
pub const KEYMAP: &[(&str, u32)] = &[
    ("bsp", 0xff08),
    ("tab", 0xff09),
    ("return", 0xff0d),
    ("enter", 0xff0d),
    ("esc", 0xff1b),
    ("ins", 0xff63),
    ("delete", 0xffff),
    ("del", 0xffff),
    ("home", 0xff50),
    ("end", 0xff57),
    ("pgup", 0xff55),
    ("pgdn", 0xff56),
    ("left", 0xff51),
    ("up", 0xff52),
    ("right", 0xff53),
    ("down", 0xff54),
    ("f1", 0xffbe),
    ("f2", 0xffbf),
    ("f3", 0xffc0),
    ("f4", 0xffc1),
    ("f5", 0xffc2),
    ("f6", 0xffc3),
    ("f7", 0xffc4),
    ("f8", 0xffc5),
    ("f9", 0xffc6),
    ("f10", 0xffc7),
    ("f11", 0xffc8),
    ("f12", 0xffc9),
    ("f13", 0xffca),
    ("f14", 0xffcb),
    ("f15", 0xffcc),
    ("f16", 0xffcd),
    ("f17", 0xffce),
    ("f18", 0xffcf),
    ("f19", 0xffd0),
    ("f20", 0xffd1),
    ("lshift", 0xffe1),
    ("shift", 0xffe1),
    ("rshift", 0xffe2),
    ("lctrl", 0xffe3),
    ("ctrl", 0xffe3),
    ("rctrl", 0xffe4),
    ("lmeta", 0xffe7),
    ("meta", 0xffe7),
    ("rmeta", 0xffe8),
    ("lalt", 0xffe9),
    ("alt", 0xffe9),
    ("ralt", 0xffea),
    ("scrlk", 0xff14),
    ("sysrq", 0xff15),
    ("numlk", 0xff7f),
    ("caplk", 0xffe5),
    ("pause", 0xff13),
    ("lsuper", 0xffeb),
    ("super", 0xffeb),
    ("rsuper", 0xffec),
    ("lhyper", 0xffed),
    ("hyper", 0xffed),
    ("rhyper", 0xffee),
    ("kp0", 0xffb0),
    ("kp1", 0xffb1),
    ("kp2", 0xffb2),
    ("kp3", 0xffb3),
    ("kp4", 0xffb4),
    ("kp5", 0xffb5),
    ("kp6", 0xffb6),
    ("kp7", 0xffb7),
    ("kp8", 0xffb8),
    ("kp9", 0xffb9),
    ("kpenter", 0xff8d),
];

/// Maps a key segment to its keysym: named keys through the table,
/// single characters to their code point.
pub fn lookup(segment: &str) -> Option<u32> {
    if let Some(&(_, keysym)) = KEYMAP.iter().find(|(name, _)| *name == segment) {
        return Some(keysym);
    }
    let mut chars = segment.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c as u32),
        _ => None,
    }
}

/// The symbolic name a recorded session writes for a keysym, falling
/// back to the literal character.
pub fn reverse(keysym: u32) -> Option<String> {
    if let Some(&(name, _)) = KEYMAP.iter().rev().find(|(_, k)| *k == keysym) {
        return Some(name.to_owned());
    }
    char::from_u32(keysym).map(|c| c.to_string())
}

/// Decodes a key argument into the keysyms to press, in press order.
/// `ctrl-alt-del` yields Control, Alt, Delete; a lone `-` is the
/// literal character.
pub fn decode(key: &str) -> Result<Vec<u32>> {
    let segments: Vec<&str> = if key.chars().count() == 1 {
        vec![key]
    } else {
        key.split('-').collect()
    };
    segments
        .iter()
        .map(|segment| {
            lookup(segment).ok_or_else(|| Error::Command(format!("unknown key {:?}", key)))
        })
        .collect()
}

/// US-keyboard characters that need shift held; with `force_caps` these
/// and uppercase letters are promoted to a `shift-` chord.
const SHIFTED: &str = "~!@#$%^&*()_+{}|:\"<>?";

pub fn force_caps(key: &str) -> String {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_uppercase() || SHIFTED.contains(c) => {
            format!("shift-{}", key)
        }
        _ => key.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_keys_resolve() {
        assert_eq!(lookup("ctrl"), Some(0xffe3));
        assert_eq!(lookup("kpenter"), Some(0xff8d));
        assert_eq!(lookup("f20"), Some(0xffd1));
    }

    #[test]
    fn single_characters_are_code_points() {
        assert_eq!(lookup("a"), Some(97));
        assert_eq!(lookup("-"), Some(45));
        assert_eq!(lookup("\u{e9}"), Some(0xe9));
        assert_eq!(lookup("notakey"), None);
    }

    #[test]
    fn chord_decodes_in_press_order() {
        assert_eq!(decode("ctrl-alt-del").unwrap(), vec![0xffe3, 0xffe9, 0xffff]);
        assert_eq!(decode("shift-a").unwrap(), vec![0xffe1, 97]);
        assert_eq!(decode("-").unwrap(), vec![45]);
        assert!(decode("ctrl-bogus").is_err());
    }

    #[test]
    fn reverse_prefers_short_alias() {
        assert_eq!(reverse(0xffe1).as_deref(), Some("shift"));
        assert_eq!(reverse(0xffe3).as_deref(), Some("ctrl"));
        assert_eq!(reverse(0xffff).as_deref(), Some("del"));
        assert_eq!(reverse(97).as_deref(), Some("a"));
    }

    #[test]
    fn force_caps_promotes_shifted_characters() {
        assert_eq!(force_caps("A"), "shift-A");
        assert_eq!(force_caps("!"), "shift-!");
        assert_eq!(force_caps("a"), "a");
        assert_eq!(force_caps("ctrl-c"), "ctrl-c");
    }
}
