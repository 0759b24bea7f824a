//! Streak arithmetic
//!
//! Pure calendar-day rules for the learning streak; persistence lives in the
//! stats aggregator.

use crate::models::LearningStreak;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// What an activity did to a streak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreakChange {
    /// First recorded activity
    Started,
    /// Activity on the day after the last one
    Extended,
    /// Activity already recorded for this day
    Unchanged,
    /// Gap of more than one day; streak restarted at 1
    Reset,
    /// Activity dated before the last recorded one; ignored
    Backdated,
}

/// Apply an activity on `activity_date` to `streak`
///
/// `longest_streak` never decreases.
pub fn advance(streak: &mut LearningStreak, activity_date: NaiveDate) -> StreakChange {
    let change = match streak.last_activity_date {
        None => {
            streak.current_streak = 1;
            streak.streak_start_date = Some(activity_date);
            StreakChange::Started
        }
        Some(last) => {
            let gap = (activity_date - last).num_days();
            match gap {
                g if g < 0 => return StreakChange::Backdated,
                0 => StreakChange::Unchanged,
                1 => {
                    streak.current_streak += 1;
                    if streak.streak_start_date.is_none() {
                        streak.streak_start_date = Some(last);
                    }
                    StreakChange::Extended
                }
                _ => {
                    streak.current_streak = 1;
                    streak.streak_start_date = Some(activity_date);
                    StreakChange::Reset
                }
            }
        }
    };

    streak.last_activity_date = Some(activity_date);
    streak.longest_streak = streak.longest_streak.max(streak.current_streak);
    change
}

/// Streak length as it should be displayed on `today`
///
/// A streak whose last activity is more than one day old has lapsed and
/// reads as 0 even before the next activity resets it.
pub fn current_as_of(streak: &LearningStreak, today: NaiveDate) -> i64 {
    match streak.last_activity_date {
        Some(last) if (today - last).num_days() <= 1 => streak.current_streak,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn streak_at(last: NaiveDate, current: i64, longest: i64) -> LearningStreak {
        LearningStreak {
            user_id: "u".to_string(),
            current_streak: current,
            longest_streak: longest,
            last_activity_date: Some(last),
            streak_start_date: Some(last),
        }
    }

    #[test]
    fn test_first_activity_starts_streak() {
        let mut s = LearningStreak::empty("u");
        assert_eq!(advance(&mut s, day(1)), StreakChange::Started);
        assert_eq!(s.current_streak, 1);
        assert_eq!(s.longest_streak, 1);
        assert_eq!(s.streak_start_date, Some(day(1)));
        assert_eq!(s.last_activity_date, Some(day(1)));
    }

    #[test]
    fn test_next_day_increments_by_one() {
        let mut s = streak_at(day(10), 4, 4);
        assert_eq!(advance(&mut s, day(11)), StreakChange::Extended);
        assert_eq!(s.current_streak, 5);
        assert_eq!(s.longest_streak, 5);
        assert_eq!(s.last_activity_date, Some(day(11)));
    }

    #[test]
    fn test_same_day_is_noop() {
        let mut s = streak_at(day(10), 4, 7);
        let before = s.clone();
        assert_eq!(advance(&mut s, day(10)), StreakChange::Unchanged);
        assert_eq!(s, before);
    }

    #[test]
    fn test_gap_resets_to_one() {
        let mut s = streak_at(day(10), 4, 4);
        assert_eq!(advance(&mut s, day(13)), StreakChange::Reset);
        assert_eq!(s.current_streak, 1);
        assert_eq!(s.streak_start_date, Some(day(13)));
        assert_eq!(s.longest_streak, 4);
    }

    #[test]
    fn test_backdated_activity_ignored() {
        let mut s = streak_at(day(10), 2, 2);
        let before = s.clone();
        assert_eq!(advance(&mut s, day(8)), StreakChange::Backdated);
        assert_eq!(s, before);
    }

    #[test]
    fn test_longest_never_decreases() {
        let mut s = streak_at(day(1), 1, 9);
        for d in 2..=20 {
            let previous_longest = s.longest_streak;
            advance(&mut s, day(d));
            assert!(s.longest_streak >= previous_longest);
        }
        assert_eq!(s.current_streak, 20);
        assert_eq!(s.longest_streak, 20);
    }

    #[test]
    fn test_current_as_of_lapsed_streak() {
        let s = streak_at(day(10), 6, 6);
        assert_eq!(current_as_of(&s, day(10)), 6);
        assert_eq!(current_as_of(&s, day(11)), 6);
        assert_eq!(current_as_of(&s, day(12)), 0);
        assert_eq!(current_as_of(&LearningStreak::empty("u"), day(12)), 0);
    }
}
