//! Broadcast configuration checks

use crate::dispatch::window::SendWindow;
use chrono::{DateTime, Utc};
use mailcast_common::types::EmailAddress;
use mailcast_common::{Error, Result};
use mailcast_storage::models::{
    AudienceSettings, Broadcast, CreateVariation, ScheduleSettings, TestSettings,
};

fn invalid(message: impl Into<String>) -> Error {
    Error::Validation(message.into())
}

/// Check the pieces of a broadcast that do not depend on the clock
pub fn validate_settings(
    name: &str,
    audience: &AudienceSettings,
    schedule: &ScheduleSettings,
    test: &TestSettings,
    variations: &[CreateVariation],
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(invalid("name is required"));
    }

    if variations.is_empty() {
        return Err(invalid("at least one variation is required"));
    }
    for (index, variation) in variations.iter().enumerate() {
        if variation.subject.trim().is_empty() {
            return Err(invalid(format!("variation {} has no subject", index)));
        }
        if EmailAddress::parse(&variation.from_email).is_none() {
            return Err(invalid(format!(
                "variation {} has an invalid from_email",
                index
            )));
        }
    }

    if audience.lists.is_empty() && audience.segments.is_empty() {
        return Err(invalid("audience needs at least one list or segment"));
    }
    if audience.rate_limit_per_minute == Some(0) {
        return Err(invalid("rate_limit_per_minute must be greater than zero"));
    }

    if schedule.send_immediately && schedule.scheduled_time.is_some() {
        return Err(invalid(
            "send_immediately and scheduled_time are mutually exclusive",
        ));
    }
    SendWindow::from_schedule(schedule)?;

    if test.sample_percentage > 100 {
        return Err(invalid("sample_percentage must be within 0-100"));
    }
    if test.enabled {
        if variations.len() < 2 {
            return Err(invalid("an A/B test needs at least two variations"));
        }
        if test.test_duration_hours < 1 {
            return Err(invalid("test_duration_hours must be at least 1"));
        }
        if test.sample_percentage == 0 {
            return Err(invalid("sample_percentage must be positive when testing"));
        }
    }

    Ok(())
}

/// Check a broadcast right before it leaves draft
pub fn validate_for_schedule(broadcast: &Broadcast, now: DateTime<Utc>) -> Result<()> {
    let variations: Vec<CreateVariation> = broadcast
        .ordered_variations()
        .into_iter()
        .map(|v| CreateVariation {
            name: v.name.clone(),
            template_id: v.template_id,
            template_version: v.template_version,
            subject: v.subject.clone(),
            from_name: v.from_name.clone(),
            from_email: v.from_email.clone(),
            reply_to: v.reply_to.clone(),
        })
        .collect();

    validate_settings(
        &broadcast.name,
        &broadcast.audience,
        &broadcast.schedule,
        &broadcast.test_settings,
        &variations,
    )?;

    match (broadcast.schedule.send_immediately, broadcast.schedule.scheduled_time) {
        (true, None) => Ok(()),
        (false, Some(at)) if at > now => Ok(()),
        (false, Some(_)) => Err(invalid("scheduled_time must be in the future")),
        (false, None) => Err(invalid(
            "either send_immediately or scheduled_time is required",
        )),
        (true, Some(_)) => Err(invalid(
            "send_immediately and scheduled_time are mutually exclusive",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn variation(subject: &str, from: &str) -> CreateVariation {
        CreateVariation {
            name: "A".into(),
            template_id: Uuid::new_v4(),
            template_version: 1,
            subject: subject.into(),
            from_name: None,
            from_email: from.into(),
            reply_to: None,
        }
    }

    fn audience() -> AudienceSettings {
        AudienceSettings {
            lists: vec![Uuid::new_v4()],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_settings() {
        let result = validate_settings(
            "Launch",
            &audience(),
            &ScheduleSettings::default(),
            &TestSettings::default(),
            &[variation("Hi", "news@example.com")],
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_rejects_bad_from_email() {
        let result = validate_settings(
            "Launch",
            &audience(),
            &ScheduleSettings::default(),
            &TestSettings::default(),
            &[variation("Hi", "not-an-address")],
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_rejects_empty_audience() {
        let result = validate_settings(
            "Launch",
            &AudienceSettings::default(),
            &ScheduleSettings::default(),
            &TestSettings::default(),
            &[variation("Hi", "news@example.com")],
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_ab_test_needs_two_variations() {
        let test = TestSettings {
            enabled: true,
            sample_percentage: 20,
            ..Default::default()
        };
        let result = validate_settings(
            "Launch",
            &audience(),
            &ScheduleSettings::default(),
            &test,
            &[variation("Hi", "news@example.com")],
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_sample_percentage_bounds() {
        let test = TestSettings {
            sample_percentage: 101,
            ..Default::default()
        };
        let result = validate_settings(
            "Launch",
            &audience(),
            &ScheduleSettings::default(),
            &test,
            &[variation("Hi", "news@example.com")],
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_window_must_parse() {
        let schedule = ScheduleSettings {
            use_recipient_timezone: true,
            time_window_start: Some("9am".into()),
            time_window_end: Some("17:00".into()),
            ..Default::default()
        };
        let result = validate_settings(
            "Launch",
            &audience(),
            &schedule,
            &TestSettings::default(),
            &[variation("Hi", "news@example.com")],
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
