//! Collision-resistant identifier generation for the `_id` reserved column.

use uuid::Uuid;

pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
