use super::types::Schema;
use crate::error::Result;
use std::path::Path;

/// Parse a schema file (YAML or JSON) into a Schema
pub fn parse_schema(path: &Path) -> Result<Schema> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema string into a Schema. JSON is accepted since it is valid YAML.
pub fn parse_schema_str(content: &str) -> Result<Schema> {
    if content.trim().is_empty() {
        return Ok(Schema::new());
    }
    let schema: Schema = serde_yaml::from_str(content)?;
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DeletePolicy, InsertPolicy};
    use std::io::Write;

    #[test]
    fn test_parse_yaml_schema() {
        let schema = parse_schema_str(
            r#"
Author:
  foreign:
    favoriteBooks.$: { collection: Book, onDelete: PULL }
Book:
  primary: isbn
  foreign:
    author: { collection: Author, onDelete: DELETE, onInsert: BYPASS, nullable: true }
"#,
        )
        .unwrap();

        assert_eq!(schema.len(), 2);
        let book = &schema["Book"];
        assert_eq!(book.primary.as_deref(), Some("isbn"));
        let author = &book.foreign["author"];
        assert_eq!(author.on_delete, DeletePolicy::Remove);
        assert_eq!(author.on_insert, InsertPolicy::Bypass);
        assert!(author.nullable);
        assert!(!author.optional);

        let favorite = &schema["Author"].foreign["favoriteBooks.$"];
        assert_eq!(favorite.on_insert, InsertPolicy::Verify);
        assert_eq!(favorite.on_delete, DeletePolicy::Pull);
    }

    #[test]
    fn test_parse_json_schema() {
        let schema = parse_schema_str(
            r#"{ "Book": { "foreign": { "author": { "collection": "Author" } } }, "Author": {} }"#,
        )
        .unwrap();
        assert_eq!(schema["Book"].foreign["author"].on_delete, DeletePolicy::Reject);
        assert!(schema["Author"].foreign.is_empty());
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let result = parse_schema_str("Book:\n  foreign:\n    author: { collection: Author, onDelete: EXPLODE }");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_schema_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Book:\n  foreign:\n    author: {{ collection: Author }}\nAuthor: {{}}").unwrap();
        let schema = parse_schema(file.path()).unwrap();
        assert!(schema.contains_key("Author"));
    }

    #[test]
    fn test_empty_schema() {
        assert!(parse_schema_str("  \n").unwrap().is_empty());
    }
}
