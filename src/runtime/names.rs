//! Qualified entity names: `name@provider`.

/// Provider part of a qualified name, `None` when the name is not qualified.
pub fn provider_of(name: &str) -> Option<&str> {
    name.split('@').nth(1).filter(|p| !p.is_empty())
}

/// Qualify `name` with `provider` unless it already carries a provider.
pub fn qualify(provider: &str, name: &str) -> String {
    if name.contains('@') {
        name.to_string()
    } else {
        format!("{}@{}", name, provider)
    }
}
