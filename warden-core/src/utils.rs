use deunicode::deunicode_char;

/// Normalize a resource or operation name to lower snake case.
///
/// Accepts any human input ("Product Catalog", "read-only", camelCase) and
/// produces the canonical form used in policy keys. Unicode is transliterated
/// to ASCII first, separator runs collapse to a single underscore.
pub fn snake_case<S: AsRef<str>>(s: S) -> String {
    _snake_case(s.as_ref())
}

// avoid unnecessary monomorphizations
fn _snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    // Starts with true to avoid a leading underscore
    let mut prev_sep = true;
    let mut prev_lower = false;
    {
        let mut push_char = |x: u8| {
            match x {
                b'a'..=b'z' | b'0'..=b'9' => {
                    prev_sep = false;
                    prev_lower = true;
                    out.push(x.into());
                }
                b'A'..=b'Z' => {
                    // Word boundary inside camelCase input
                    if prev_lower {
                        out.push('_');
                    }
                    prev_sep = false;
                    prev_lower = false;
                    out.push((x - b'A' + b'a').into());
                }
                _ => {
                    if !prev_sep {
                        out.push('_');
                        prev_sep = true;
                    }
                    prev_lower = false;
                }
            }
        };

        for c in s.chars() {
            if c.is_ascii() {
                (push_char)(c as u8);
            } else {
                for &cx in deunicode_char(c).unwrap_or("_").as_bytes() {
                    (push_char)(cx);
                }
            }
        }
    }

    if out.ends_with('_') {
        out.pop();
    }
    // We likely reserved more space than needed.
    out.shrink_to_fit();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_joins_words() {
        assert_eq!(snake_case("Product Catalog"), "product_catalog");
        assert_eq!(snake_case("read-only"), "read_only");
    }

    #[test]
    fn splits_camel_case() {
        assert_eq!(snake_case("ProductCatalog"), "product_catalog");
        assert_eq!(snake_case("createOrder"), "create_order");
    }

    #[test]
    fn collapses_separator_runs_and_trims() {
        assert_eq!(snake_case("  product --- catalog  "), "product_catalog");
        assert_eq!(snake_case("__already_snake__"), "already_snake");
    }

    #[test]
    fn transliterates_unicode() {
        assert_eq!(snake_case("Crème Brûlée"), "creme_brulee");
    }

    #[test]
    fn keeps_digits() {
        assert_eq!(snake_case("v2 Orders"), "v2_orders");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(snake_case(""), "");
        assert_eq!(snake_case("---"), "");
    }
}
