//! Validation helpers for DTOs.

use validator::ValidationError;

use crate::services::recalculator::MAX_REMINDER_OFFSET_MINUTES;

/// Validates that every reminder offset lies in `1..=10080` minutes.
///
/// # Examples
///
/// ```ignore
/// validate_reminder_offsets(&[60, 15]) // Ok
/// validate_reminder_offsets(&[0])      // Err - zero
/// validate_reminder_offsets(&[20_000]) // Err - more than a week
/// ```
pub fn validate_reminder_offsets(offsets: &[u32]) -> Result<(), ValidationError> {
    if let Some(offset) = offsets
        .iter()
        .find(|offset| **offset == 0 || **offset > MAX_REMINDER_OFFSET_MINUTES)
    {
        let mut err = ValidationError::new("reminder_offset_range");
        err.message = Some(
            format!(
                "Reminder offsets must be between 1 and {MAX_REMINDER_OFFSET_MINUTES} minutes (got {offset})"
            )
            .into(),
        );
        return Err(err);
    }

    Ok(())
}
