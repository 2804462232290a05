/// Channel and membership modes as advertised by the remote server.
///
/// Membership glyphs (`@`, `+`, ...) are translated to mode letters through
/// the server's `PREFIX` table, and `MODE` lines are split into individual
/// changes using the `CHANMODES` classification.
use serde::Serialize;

/// Conventional glyph → letter table used until the server sends `PREFIX`.
const DEFAULT_PREFIXES: [(char, char); 5] =
    [('~', 'q'), ('&', 'a'), ('@', 'o'), ('%', 'h'), ('+', 'v')];

/// Ordered glyph → letter table, highest rank first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefixTable {
    entries: Vec<(char, char)>,
}

impl Default for PrefixTable {
    fn default() -> Self {
        Self {
            entries: DEFAULT_PREFIXES.to_vec(),
        }
    }
}

impl PrefixTable {
    /// Parse the value of an ISUPPORT `PREFIX` token, e.g. `(ov)@+`.
    ///
    /// Returns `None` when letters and glyphs don't pair up.
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix('(')?;
        let (letters, glyphs) = rest.split_once(')')?;
        if letters.chars().count() != glyphs.chars().count() {
            return None;
        }
        Some(Self {
            entries: glyphs.chars().zip(letters.chars()).collect(),
        })
    }

    pub fn letter_for(&self, glyph: char) -> Option<char> {
        self.entries.iter().find(|(g, _)| *g == glyph).map(|(_, l)| *l)
    }

    pub fn glyph_for(&self, letter: char) -> Option<char> {
        self.entries.iter().find(|(_, l)| *l == letter).map(|(g, _)| *g)
    }

    pub fn is_glyph(&self, c: char) -> bool {
        self.letter_for(c).is_some()
    }

    /// Whether `letter` is a membership mode (`o`, `v`, ...).
    pub fn is_membership_mode(&self, letter: char) -> bool {
        self.glyph_for(letter).is_some()
    }

    /// Split `@+alice` into (`['o', 'v']`, `"alice"`).
    pub fn split_prefixed<'a>(&self, prefixed: &'a str) -> (Vec<char>, &'a str) {
        let nick = prefixed.trim_start_matches(|c| self.is_glyph(c));
        let glyphs = &prefixed[..prefixed.len() - nick.len()];
        (self.letters_for_glyphs(glyphs), nick)
    }

    /// Split a channel from a 319 list, e.g. `@&ops` into (`['o']`, `"&ops"`).
    ///
    /// `&` is both a glyph and a channel type on most servers, so glyphs are
    /// stripped only as far as the rest still starts with one of `chantypes`.
    pub fn split_prefixed_channel<'a>(
        &self,
        prefixed: &'a str,
        chantypes: &str,
    ) -> (Vec<char>, &'a str) {
        let is_channel = |s: &str| s.chars().next().is_some_and(|c| chantypes.contains(c));
        let mut split = None;
        for (idx, c) in prefixed.char_indices() {
            if is_channel(&prefixed[idx..]) {
                split = Some(idx);
            }
            if !self.is_glyph(c) {
                break;
            }
        }
        match split {
            Some(idx) => (self.letters_for_glyphs(&prefixed[..idx]), &prefixed[idx..]),
            None => self.split_prefixed(prefixed),
        }
    }

    /// Translate a string of glyphs to letters, skipping unknown glyphs.
    pub fn letters_for_glyphs(&self, glyphs: &str) -> Vec<char> {
        let mut letters = Vec::new();
        for glyph in glyphs.chars() {
            if let Some(letter) = self.letter_for(glyph) {
                if !letters.contains(&letter) {
                    letters.push(letter);
                }
            }
        }
        letters
    }

    pub fn entries(&self) -> &[(char, char)] {
        &self.entries
    }
}

/// CHANMODES classification (`A,B,C,D`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChanModes {
    /// Type A: list modes, always take a parameter (`b`, `e`, `I`).
    pub list: String,
    /// Type B: always take a parameter (`k`).
    pub always_param: String,
    /// Type C: take a parameter only when set (`l`).
    pub set_param: String,
    /// Type D: plain flags.
    pub flags: String,
}

impl Default for ChanModes {
    fn default() -> Self {
        Self {
            list: "beI".into(),
            always_param: "k".into(),
            set_param: "l".into(),
            flags: "imnpst".into(),
        }
    }
}

impl ChanModes {
    /// Parse the value of an ISUPPORT `CHANMODES` token.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(',');
        Some(Self {
            list: parts.next()?.into(),
            always_param: parts.next()?.into(),
            set_param: parts.next()?.into(),
            flags: parts.next().unwrap_or_default().into(),
        })
    }

    fn takes_param(&self, mode: char, setting: bool) -> bool {
        self.list.contains(mode)
            || self.always_param.contains(mode)
            || (setting && self.set_param.contains(mode))
    }
}

/// One change out of a `MODE` line: `+o alice`, `-m`, `+k secret`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    /// true = `+`, false = `-`.
    pub setting: bool,
    pub mode: char,
    pub param: Option<String>,
}

/// Split a mode string and its parameters into individual changes.
///
/// Membership modes consume a nick; other modes consume a parameter
/// according to their CHANMODES type. Missing parameters yield `None`.
pub fn parse_mode_changes(
    mode_str: &str,
    params: &[String],
    prefixes: &PrefixTable,
    chanmodes: &ChanModes,
) -> Vec<ModeChange> {
    let mut changes = Vec::new();
    let mut setting = true;
    let mut params = params.iter();

    for ch in mode_str.chars() {
        match ch {
            '+' => setting = true,
            '-' => setting = false,
            mode => {
                let param = if prefixes.is_membership_mode(mode)
                    || chanmodes.takes_param(mode, setting)
                {
                    params.next().cloned()
                } else {
                    None
                };
                changes.push(ModeChange {
                    setting,
                    mode,
                    param,
                });
            }
        }
    }
    changes
}

/// Flags derived from a member's raw mode letters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberFlags {
    pub is_operator: bool,
    pub is_half_operator: bool,
    pub is_voiced: bool,
}

impl MemberFlags {
    /// Owners (`q`) and admins (`a`) count as operators.
    pub fn from_modes(modes: &[char]) -> Self {
        Self {
            is_operator: modes.iter().any(|m| matches!(m, 'q' | 'a' | 'o')),
            is_half_operator: modes.contains(&'h'),
            is_voiced: modes.contains(&'v'),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_table_knows_common_glyphs() {
        let table = PrefixTable::default();
        assert_eq!(table.letter_for('@'), Some('o'));
        assert_eq!(table.letter_for('+'), Some('v'));
        assert_eq!(table.letter_for('%'), Some('h'));
        assert_eq!(table.letter_for('!'), None);
    }

    #[test]
    fn parse_prefix_token() {
        let table = PrefixTable::parse("(ov)@+").unwrap();
        assert_eq!(table.entries(), &[('@', 'o'), ('+', 'v')]);
        assert_eq!(table.letter_for('%'), None);
    }

    #[test]
    fn channel_split_keeps_local_channel_sigil() {
        let table = PrefixTable::default();
        assert_eq!(table.split_prefixed_channel("&ops", "#&"), (vec![], "&ops"));
        assert_eq!(table.split_prefixed_channel("@&ops", "#&"), (vec!['o'], "&ops"));
        assert_eq!(table.split_prefixed_channel("&#rust", "#&"), (vec!['a'], "#rust"));
        assert_eq!(table.split_prefixed_channel("@+#rust", "#&"), (vec!['o', 'v'], "#rust"));
        assert_eq!(table.split_prefixed_channel("#rust", "#"), (vec![], "#rust"));
    }

    #[test]
    fn parse_prefix_rejects_mismatched_lengths() {
        assert_eq!(PrefixTable::parse("(ohv)@+"), None);
        assert_eq!(PrefixTable::parse("ov@+"), None);
    }

    #[test]
    fn split_prefixed_nick() {
        let table = PrefixTable::default();
        assert_eq!(table.split_prefixed("@+alice"), (vec!['o', 'v'], "alice"));
        assert_eq!(table.split_prefixed("bob"), (vec![], "bob"));
    }

    #[test]
    fn parse_chanmodes_token() {
        let modes = ChanModes::parse("beI,k,l,imnpst").unwrap();
        assert_eq!(modes, ChanModes::default());
        assert!(ChanModes::parse("b").is_none());
    }

    #[test]
    fn mode_changes_consume_params_by_type() {
        let changes = parse_mode_changes(
            "+ov-l+kb",
            &["alice".into(), "bob".into(), "secret".into(), "*!*@bad".into()],
            &PrefixTable::default(),
            &ChanModes::default(),
        );
        assert_eq!(
            changes,
            vec![
                ModeChange { setting: true, mode: 'o', param: Some("alice".into()) },
                ModeChange { setting: true, mode: 'v', param: Some("bob".into()) },
                ModeChange { setting: false, mode: 'l', param: None },
                ModeChange { setting: true, mode: 'k', param: Some("secret".into()) },
                ModeChange { setting: true, mode: 'b', param: Some("*!*@bad".into()) },
            ]
        );
    }

    #[test]
    fn mode_changes_with_missing_param() {
        let changes =
            parse_mode_changes("+o", &[], &PrefixTable::default(), &ChanModes::default());
        assert_eq!(changes[0].param, None);
    }

    #[test]
    fn member_flags_follow_letters() {
        assert_eq!(
            MemberFlags::from_modes(&['o']),
            MemberFlags { is_operator: true, is_half_operator: false, is_voiced: false }
        );
        assert!(MemberFlags::from_modes(&['q']).is_operator);
        assert!(MemberFlags::from_modes(&['h', 'v']).is_half_operator);
        assert_eq!(MemberFlags::from_modes(&[]), MemberFlags::default());
    }
}
