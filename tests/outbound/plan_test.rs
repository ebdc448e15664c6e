//! Tests for send planning, backoff and limit validation.

use std::time::Duration;

use serde_json::json;

use tblwatch::format::{Dialect, Rendered};
use tblwatch::outbound::aggregator::{backoff_delay, plan_send};
use tblwatch::outbound::{
    split_at_char, DestinationLimits, Fragment, LengthUnit, CLOSE_FENCE, OPEN_FENCE,
};

use crate::support::small_limits;

/// Plan sends until the fragment is used up, returning every sent text.
fn drain(text: &str, limits: &DestinationLimits, unit: LengthUnit) -> Vec<String> {
    let mut fragment = Fragment::new(text);
    let mut sent = Vec::new();
    loop {
        let plan = plan_send(&fragment, limits, unit);
        sent.push(plan.text);
        let Some(consumed) = plan.split_after else {
            return sent;
        };
        let rest = fragment
            .text
            .get(consumed..)
            .expect("split should land on a char boundary");
        fragment = Fragment {
            text: rest.to_owned(),
            continued: true,
        };
        assert!(sent.len() < 100, "split never finished");
    }
}

/// Strip the fences a split adds, leaving the slice of the original text.
fn slice_body(sent: &[String], i: usize) -> &str {
    let mut body = sent[i].as_str();
    if i > 0 {
        body = body.strip_prefix(OPEN_FENCE).expect("continued slice reopens");
    }
    if i.saturating_add(1) < sent.len() {
        body = body.strip_suffix(CLOSE_FENCE).expect("split slice closes");
    }
    body
}

fn trailing_backslashes(text: &str) -> usize {
    text.chars().rev().take_while(|&c| c == '\\').count()
}

#[test]
fn fragment_within_hard_limit_is_sent_whole() {
    let plan = plan_send(&Fragment::new("short"), &small_limits(), LengthUnit::Chars);
    assert_eq!(plan.text, "short");
    assert_eq!(plan.split_after, None);
}

#[test]
fn continued_fragment_reopens_fence() {
    let fragment = Fragment {
        text: "tail\n```\n".to_owned(),
        continued: true,
    };
    let plan = plan_send(&fragment, &small_limits(), LengthUnit::Chars);
    assert_eq!(plan.text, format!("{OPEN_FENCE}tail\n```\n"));
    assert_eq!(plan.split_after, None);
}

#[test]
fn fence_overhead_counts_toward_hard_limit() {
    let limits = small_limits();
    // 33 + 8 opening characters exceeds 40, so a continued 33-char fragment splits.
    let fragment = Fragment {
        text: "m".repeat(33),
        continued: true,
    };
    let plan = plan_send(&fragment, &limits, LengthUnit::Chars);
    assert_eq!(plan.split_after, Some(28));
    assert_eq!(plan.text.chars().count(), limits.hard_limit);
    assert!(plan.text.starts_with(OPEN_FENCE));
    assert!(plan.text.ends_with(CLOSE_FENCE));
}

#[test]
fn split_counts_characters_not_bytes() {
    let text = "ü".repeat(100);
    let plan = plan_send(&Fragment::new(text), &small_limits(), LengthUnit::Chars);
    // 36 two-byte characters.
    assert_eq!(plan.split_after, Some(72));
    assert_eq!(plan.text.chars().count(), 40);
}

#[test]
fn split_never_separates_backslash_from_escaped_character() {
    // Non-continued slices take 36 characters; the 36th is the backslash.
    let text = format!("{}\\`tick\\`", "a".repeat(35));
    let plan = plan_send(&Fragment::new(text), &small_limits(), LengthUnit::Chars);
    assert_eq!(plan.split_after, Some(35));
    assert_eq!(plan.text, format!("{}{CLOSE_FENCE}", "a".repeat(35)));
}

#[test]
fn split_keeps_complete_escaped_backslash() {
    // An escaped backslash is two characters and may end a slice.
    let text = format!("{}\\\\rest of the text", "a".repeat(34));
    let plan = plan_send(&Fragment::new(text), &small_limits(), LengthUnit::Chars);
    assert_eq!(plan.split_after, Some(36));
    assert!(plan.text.ends_with(&format!("\\\\{CLOSE_FENCE}")));
}

#[test]
fn telegram_slices_of_large_escaped_body_stay_well_formed() {
    let limits = DestinationLimits::default();
    let unit = Dialect::TelegramMarkdown.length_unit();

    for pad in 4041..4141 {
        let value = format!("{}`tick`", "x".repeat(pad));
        let rendered = Rendered::Change {
            headline: "Insert",
            table: "users".to_owned(),
            body: json!({ "v": value }),
        }
        .render(Dialect::TelegramMarkdown);

        let sent = drain(&rendered, &limits, unit);
        assert!(sent.len() > 1, "pad {pad} should split");

        let mut rebuilt = String::new();
        for i in 0..sent.len() {
            assert!(
                unit.measure(&sent[i]) <= limits.hard_limit,
                "pad {pad}: slice {i} exceeds the hard limit"
            );
            let body = slice_body(&sent, i);
            assert_eq!(
                trailing_backslashes(body).rem_euclid(2),
                0,
                "pad {pad}: slice {i} ends inside an escape: {:?}",
                body.chars().rev().take(8).collect::<String>()
            );
            rebuilt.push_str(body);
        }
        assert_eq!(rebuilt, rendered, "pad {pad}: slices should rebuild the message");
    }
}

#[test]
fn utf16_limits_count_astral_characters_twice() {
    let text = "😀".repeat(30);
    assert_eq!(LengthUnit::Chars.measure(&text), 30);
    assert_eq!(LengthUnit::Utf16.measure(&text), 60);

    let plan = plan_send(&Fragment::new(text.clone()), &small_limits(), LengthUnit::Utf16);
    // 36 code units leave room for 18 emoji of 4 bytes each.
    assert_eq!(plan.split_after, Some(72));
    assert_eq!(LengthUnit::Utf16.measure(&plan.text), 40);

    let whole = plan_send(&Fragment::new(text), &small_limits(), LengthUnit::Chars);
    assert_eq!(whole.split_after, None);
}

#[test]
fn utf16_split_stops_before_a_character_that_would_overflow() {
    assert_eq!(LengthUnit::Utf16.split("a😀b", 2), ("a", "😀b"));
    assert_eq!(LengthUnit::Utf16.split("a😀b", 3), ("a😀", "b"));
    assert_eq!(LengthUnit::Utf16.split("ab", 9), ("ab", ""));
}

#[test]
fn dialects_pick_their_length_unit() {
    assert_eq!(Dialect::TelegramMarkdown.length_unit(), LengthUnit::Utf16);
    assert_eq!(Dialect::Plain.length_unit(), LengthUnit::Chars);
}

#[test]
fn split_at_char_handles_multibyte_and_overflow() {
    assert_eq!(split_at_char("añb", 2), ("añ", "b"));
    assert_eq!(split_at_char("ab", 5), ("ab", ""));
}

#[test]
fn backoff_doubles_and_caps() {
    let limits = DestinationLimits::default();
    assert_eq!(backoff_delay(&limits, 0), Duration::ZERO);
    assert_eq!(backoff_delay(&limits, 1), Duration::from_secs(1));
    assert_eq!(backoff_delay(&limits, 2), Duration::from_secs(2));
    assert_eq!(backoff_delay(&limits, 5), Duration::from_secs(16));
    assert_eq!(backoff_delay(&limits, 6), Duration::from_secs(30));
    assert_eq!(backoff_delay(&limits, u32::MAX), Duration::from_secs(30));
}

#[test]
fn limits_validation_rejects_unworkable_values() {
    assert!(DestinationLimits::default().validate().is_ok());

    let too_small = DestinationLimits {
        hard_limit: 12,
        soft_limit: 10,
        ..DestinationLimits::default()
    };
    assert!(too_small.validate().is_err());

    let inverted = DestinationLimits {
        soft_limit: 5000,
        ..DestinationLimits::default()
    };
    assert!(inverted.validate().is_err());
}
