//! Request rules for the delivery messages.

use rpcmux::{Validate, ValidationOutcome, Validator};

use crate::proto::{GetPackageInfoRequest, Package, Person};

pub const MAX_DESCRIPTION_LEN: usize = 256;
pub const MAX_FRAGILE_NOTE_LEN: usize = 128;

impl Validate for GetPackageInfoRequest {
    fn validate(&self) -> ValidationOutcome {
        Validator::new().int_gt("id", self.id.into(), 0).finish()
    }
}

impl Validate for Package {
    fn validate(&self) -> ValidationOutcome {
        let validator = Validator::new()
            .int_gt("id", self.id.into(), 0)
            .max_len("description", &self.description, MAX_DESCRIPTION_LEN)
            .float_gte("weight_kg", self.weight_kg.into(), 0.0);
        match &self.fragile_note {
            Some(note) => validator.max_len("fragile_note", note, MAX_FRAGILE_NOTE_LEN),
            None => validator,
        }
        .finish()
    }
}

impl Validate for Person {
    fn validate(&self) -> ValidationOutcome {
        Validator::new()
            .min_len("name", &self.name, 1)
            .each("packages", &self.packages)
            .finish()
    }
}
