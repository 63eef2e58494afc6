//! Stable object-path slugs derived from project names.

/// Lowercases, maps runs of non-alphanumerics to single dashes, and trims.
///
/// Falls back to `"project"` for names with no usable characters so object
/// paths never end up empty.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }

    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_slugs() {
        assert_eq!(slugify("Flower Classifier"), "flower-classifier");
        assert_eq!(slugify("Tomato  Leaf/Disease!"), "tomato-leaf-disease");
        assert_eq!(slugify("résumé scanner"), "r-sum-scanner");
    }

    #[test]
    fn test_degenerate_names_fall_back() {
        assert_eq!(slugify(""), "project");
        assert_eq!(slugify("!!!"), "project");
    }

    #[test]
    fn test_idempotent() {
        let once = slugify("My Great Model v2");
        assert_eq!(slugify(&once), once);
    }
}
