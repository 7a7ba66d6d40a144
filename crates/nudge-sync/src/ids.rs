//! Reminder and list id minting.

use uuid::Uuid;

const ID_LEN: usize = 8;

/// Mint a short random id that `is_taken` rejects for none of reminders or lists.
pub fn new_id(is_taken: impl Fn(&str) -> bool) -> String {
    loop {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(ID_LEN);
        if !is_taken(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_new_id_skips_taken() {
        let attempts = Cell::new(0);
        let id = new_id(|_| {
            attempts.set(attempts.get() + 1);
            attempts.get() < 3
        });
        assert_eq!(attempts.get(), 3);
        assert_eq!(id.len(), ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
