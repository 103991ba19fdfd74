//! Parsers for the plain-text lists soco-cli prints.

use crate::protocol::{ListItem, QueueItem};

// soco-cli answers some list commands with a bare status word instead of a list.
const STATUS_WORDS: &[&str] = &[
    "on",
    "off",
    "stopped",
    "playing",
    "paused",
    "transitioning",
    "in progress",
    "shuffle",
    "repeat",
    "crossfade",
];

fn is_status_word(text: &str) -> bool {
    let lower = text.to_lowercase();
    STATUS_WORDS.contains(&lower.as_str())
}

/// Parses `N: name` lines (favourites, playlists, radio stations).
pub fn parse_numbered_list(output: &str) -> Vec<ListItem> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_status_word(line))
        .filter_map(|line| {
            let (number, name) = split_number(line)?;
            if name.is_empty() || is_status_word(name) {
                return None;
            }
            Some(ListItem {
                number,
                name: name.to_string(),
            })
        })
        .collect()
}

/// Parses `list_queue` output; `*` or `*>` marks the current track.
pub fn parse_queue_list(output: &str) -> Vec<QueueItem> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let is_current = line.contains('*');
            let cleaned = line.replace("*>", "").replace('*', "");
            let (number, content) = split_number(cleaned.trim())?;

            let mut item = QueueItem {
                number,
                is_current,
                ..QueueItem::default()
            };
            for part in content.split('|').map(str::trim) {
                if let Some(value) = strip_label(part, "artist:") {
                    item.artist = value.to_string();
                } else if let Some(value) = strip_label(part, "album:") {
                    item.album = value.to_string();
                } else if let Some(value) = strip_label(part, "title:") {
                    item.title = value.to_string();
                }
            }
            if item.title.is_empty() && item.artist.is_empty() {
                item.title = content.to_string();
            }
            Some(item)
        })
        .collect()
}

fn split_number(line: &str) -> Option<(u32, &str)> {
    let (number, rest) = line.split_once(':')?;
    let number = number.trim();
    if number.is_empty() {
        return None;
    }
    Some((number.parse().ok()?, rest.trim()))
}

fn strip_label<'a>(part: &'a str, label: &str) -> Option<&'a str> {
    let head = part.get(..label.len())?;
    head.eq_ignore_ascii_case(label)
        .then(|| part[label.len()..].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_list_skips_noise_and_status_words() {
        let output = "  1: Radio 4\n\nplaying\n2: Jazz FM\nnot a line\n3: off\nx: bad\n";
        let items = parse_numbered_list(output);
        assert_eq!(
            items,
            vec![
                ListItem {
                    number: 1,
                    name: "Radio 4".to_string()
                },
                ListItem {
                    number: 2,
                    name: "Jazz FM".to_string()
                },
            ]
        );
    }

    #[test]
    fn numbered_list_keeps_colons_in_names() {
        let items = parse_numbered_list("4: Mix: Late Night");
        assert_eq!(items[0].name, "Mix: Late Night");
    }

    #[test]
    fn queue_list_splits_structured_entries() {
        let output = "  1: Artist: Miles Davis | Album: Kind of Blue | Title: So What\n *> 2: Artist: Bill Evans | Album: Portrait | Title: Autumn Leaves\n";
        let items = parse_queue_list(output);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].artist, "Miles Davis");
        assert_eq!(items[0].album, "Kind of Blue");
        assert_eq!(items[0].title, "So What");
        assert!(!items[0].is_current);
        assert_eq!(items[1].number, 2);
        assert!(items[1].is_current);
        assert_eq!(items[1].title, "Autumn Leaves");
    }

    #[test]
    fn unstructured_queue_entry_becomes_title() {
        let items = parse_queue_list("7: Some stream name\nnope\n");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].number, 7);
        assert_eq!(items[0].title, "Some stream name");
        assert!(items[0].artist.is_empty());
    }

    #[test]
    fn empty_output_yields_nothing() {
        assert!(parse_numbered_list("").is_empty());
        assert!(parse_queue_list("   \n").is_empty());
    }
}
