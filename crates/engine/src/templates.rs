//! Template segmentation for `${{ ... }}` strings.

use crate::error::TemplateError;

const OPEN: &str = "${{";

/// A piece of a templated string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSegment<'a> {
    /// Text copied verbatim.
    Literal(&'a str),
    /// Expression between the delimiters, trimmed.
    Expression(&'a str),
}

/// Returns `true` when `value` contains a template opener.
pub fn contains_template(value: &str) -> bool {
    value.contains(OPEN)
}

/// Splits `template` into literal text and expressions.
///
/// Closing `}}` inside quoted strings or nested braces does not terminate the
/// expression, so object literals are allowed inside templates.
pub fn parse_template(template: &str) -> Result<Vec<TemplateSegment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut offset = 0usize;

    while let Some(relative_start) = template[offset..].find(OPEN) {
        let start = offset + relative_start;
        if start > offset {
            segments.push(TemplateSegment::Literal(&template[offset..start]));
        }
        let body_start = start + OPEN.len();
        let Some(body_len) = find_template_end(&template[body_start..]) else {
            return Err(TemplateError::Unterminated {
                template: template.to_string(),
                position: start,
            });
        };
        let expression = template[body_start..body_start + body_len].trim();
        if expression.is_empty() {
            return Err(TemplateError::EmptyExpression {
                template: template.to_string(),
            });
        }
        segments.push(TemplateSegment::Expression(expression));
        offset = body_start + body_len + 2;
    }

    if offset < template.len() {
        segments.push(TemplateSegment::Literal(&template[offset..]));
    }
    Ok(segments)
}

/// If `template` consists of exactly one expression (surrounding whitespace
/// allowed), returns that expression.
pub fn whole_expression(template: &str) -> Result<Option<&str>, TemplateError> {
    let segments = parse_template(template)?;
    let mut expression = None;
    for segment in segments {
        match segment {
            TemplateSegment::Expression(inner) if expression.is_none() => expression = Some(inner),
            TemplateSegment::Expression(_) => return Ok(None),
            TemplateSegment::Literal(text) if text.trim().is_empty() => {}
            TemplateSegment::Literal(_) => return Ok(None),
        }
    }
    Ok(expression)
}

/// Extracts template expressions from a string value, skipping malformed ones.
pub fn extract_template_expressions(value: &str) -> Vec<String> {
    parse_template(value)
        .map(|segments| {
            segments
                .into_iter()
                .filter_map(|segment| match segment {
                    TemplateSegment::Expression(expression) => Some(expression.to_string()),
                    TemplateSegment::Literal(_) => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Strips an optional `${{ ... }}` wrapper from a bare expression such as an `assert`.
pub fn normalize_expression(raw_expression: &str) -> Result<String, TemplateError> {
    let trimmed = raw_expression.trim();
    if let Some(expression) = whole_expression(trimmed)? {
        return Ok(expression.to_string());
    }
    Ok(trimmed.to_string())
}

/// Byte length of the expression body, or `None` when unterminated.
fn find_template_end(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut index = 0usize;

    while index < bytes.len() {
        let byte = bytes[index];
        if let Some(open_quote) = quote {
            if byte == b'\\' {
                index += 2;
                continue;
            }
            if byte == open_quote {
                quote = None;
            }
            index += 1;
            continue;
        }
        match byte {
            b'"' | b'\'' => quote = Some(byte),
            b'{' => depth += 1,
            b'}' if depth == 0 && bytes.get(index + 1) == Some(&b'}') => return Some(index),
            b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        index += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_literals_and_expressions() {
        let segments = parse_template("Hello ${{ ctx.item.name }}, you have ${{env.COUNT}} items").unwrap();
        assert_eq!(
            segments,
            vec![
                TemplateSegment::Literal("Hello "),
                TemplateSegment::Expression("ctx.item.name"),
                TemplateSegment::Literal(", you have "),
                TemplateSegment::Expression("env.COUNT"),
                TemplateSegment::Literal(" items"),
            ]
        );
    }

    #[test]
    fn braces_inside_strings_and_objects_do_not_close() {
        let segments = parse_template("${{ {\"a\": {\"b\": \"}}\"}} }}").unwrap();
        assert_eq!(segments, vec![TemplateSegment::Expression("{\"a\": {\"b\": \"}}\"}}")]);
    }

    #[test]
    fn reports_unterminated_and_empty_templates() {
        assert!(matches!(
            parse_template("value: ${{ ctx.item"),
            Err(TemplateError::Unterminated { position: 7, .. })
        ));
        assert!(matches!(parse_template("${{   }}"), Err(TemplateError::EmptyExpression { .. })));
    }

    #[test]
    fn whole_expression_detection() {
        assert_eq!(whole_expression("  ${{ ctx.items }} ").unwrap(), Some("ctx.items"));
        assert_eq!(whole_expression("id-${{ ctx.itemIndex }}").unwrap(), None);
        assert_eq!(whole_expression("${{ a }}${{ b }}").unwrap(), None);
        assert_eq!(whole_expression("plain").unwrap(), None);
    }

    #[test]
    fn normalizes_wrapped_assertions() {
        assert_eq!(normalize_expression("${{ ctx.ok }}").unwrap(), "ctx.ok");
        assert_eq!(normalize_expression(" ctx.result.length > 0 ").unwrap(), "ctx.result.length > 0");
        assert_eq!(extract_template_expressions("${{ a }} and ${{ b }}"), vec!["a".to_string(), "b".to_string()]);
    }
}
