use std::any::Any;

/// Render a panic payload (`&str` or `String`) for logs and error responses.
pub fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "<non-string panic payload>".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_str_and_string_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_payload_to_string(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_payload_to_string(payload.as_ref()), "formatted 1");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
        assert_eq!(
            panic_payload_to_string(payload.as_ref()),
            "<non-string panic payload>"
        );
    }
}
