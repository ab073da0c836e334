use crate::errors::{Error, Result};
use crate::model::NewReading;

const MAX_IDENTIFIER_LEN: usize = 128;

/// Validates the structural shape of a reading before it reaches the store.
///
/// Dashboard and field existence is checked by the gateways, not here.
pub fn validate(reading: &NewReading) -> Result<()> {
    validate_value(reading.value)?;
    validate_identifier("Dashboard ID", &reading.dashboard_id)?;
    validate_identifier("Field name", &reading.field_name)?;
    Ok(())
}

pub fn validate_value(value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(Error::Validation(format!("Value {} is not a finite number", value)));
    }
    Ok(())
}

pub fn validate_identifier(what: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::Validation(format!("{} cannot be empty", what)));
    }

    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::Validation(format!(
            "{} exceeds {} bytes",
            what, MAX_IDENTIFIER_LEN
        )));
    }

    // MQTT topic separators and wildcards would make the id unaddressable
    if id.contains(['/', '+', '#']) {
        return Err(Error::Validation(format!(
            "{} '{}' contains a reserved character",
            what, id
        )));
    }

    Ok(())
}
