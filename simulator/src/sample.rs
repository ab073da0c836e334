use rand::Rng;

/// Sampling profile for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldProfile {
    pub name: String,
    pub base: f64,
    pub variation: f64,
    pub min: f64,
    pub max: f64,
}

impl FieldProfile {
    /// Known tank sensors get realistic ranges, anything else hovers around 50.
    pub fn for_field(name: &str) -> Self {
        let (base, variation, min, max) = match name.to_ascii_lowercase().as_str() {
            "temp" | "temperature" => (25.0, 2.0, 15.0, 35.0),
            "level" => (65.0, 10.0, 0.0, 100.0),
            "ph" => (7.2, 0.3, 6.5, 8.5),
            "pressure" => (1013.25, 50.0, 950.0, 1050.0),
            _ => (50.0, 5.0, 0.0, 100.0),
        };
        Self {
            name: name.to_string(),
            base,
            variation,
            min,
            max,
        }
    }

    pub fn sample(&self, rng: &mut impl Rng) -> f64 {
        let raw = self.base + rng.gen_range(-self.variation..=self.variation);
        round2(raw.clamp(self.min, self.max))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Payload for one publish. Occasionally garbage, to exercise rejection paths.
pub fn payload(profile: &FieldProfile, invalid_ratio: f64, rng: &mut impl Rng) -> String {
    if invalid_ratio > 0.0 && rng.gen_bool(invalid_ratio.min(1.0)) {
        "not-a-number".to_string()
    } else {
        format!("{:.2}", profile.sample(rng))
    }
}
