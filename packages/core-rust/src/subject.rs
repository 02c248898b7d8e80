//! Subject naming used by the built-in server stub and client helper.

use crate::descriptor::ServiceDescriptor;

/// Prefix of reply inbox subjects.
pub const INBOX_PREFIX: &str = "_INBOX";

/// Subject a method of `descriptor` is served on: `<protocol>.<service>.<method>`.
#[must_use]
pub fn method_subject(descriptor: &ServiceDescriptor, method: &str) -> String {
    format!("{}.{}.{}", descriptor.protocol(), descriptor.service(), method)
}

/// Queue group shared by every server instance of `descriptor`, so each
/// request is handled by exactly one of them.
#[must_use]
pub fn queue_group(descriptor: &ServiceDescriptor) -> String {
    format!("{}.{}", descriptor.protocol(), descriptor.service())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_subject_and_queue_group() {
        let d = ServiceDescriptor::new("echo", "EchoService");
        assert_eq!(method_subject(&d, "Echo"), "echo.EchoService.Echo");
        assert_eq!(queue_group(&d), "echo.EchoService");
    }
}
