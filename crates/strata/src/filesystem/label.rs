//! SELinux mount label formatting.

/// Attach a security label to a mount option string.
///
/// An empty label leaves the options untouched. The label is quoted so that
/// the commas and colons of a full context survive option parsing.
#[must_use]
pub fn format_mount_label(options: &str, label: &str) -> String {
    match (options.is_empty(), label.is_empty()) {
        (_, true) => options.to_string(),
        (true, false) => format!("context={label:?}"),
        (false, false) => format!("{options},context={label:?}"),
    }
}
