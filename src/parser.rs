//! Hand-rolled SQL front end: a tokenizer and a recursive descent parser
//! producing [`Statement`] values.
//!
//! The dialect is the engine's own: CREATE/DROP TABLE, INSERT, SELECT
//! (columns, `*`, `COUNT(*)`), UPDATE, DELETE, WHERE conjunctions with
//! comparison and null-check operators, LIMIT/OFFSET, and the transaction
//! verbs. Keywords are case-insensitive; strings use single quotes with
//! doubled-quote escapes.

use crate::error::{Error, Result};
use crate::row::Value;
use crate::schema::{Column, ColumnKind};
use crate::statement::{
    Assignment, CompareOp, Condition, SelectField, Statement, StatementKind,
};

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    Star,
    Semicolon,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("'{}'", s),
            Token::Int(v) => format!("{}", v),
            Token::Float(v) => format!("{}", v),
            Token::Str(s) => format!("'{}'", s),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Star => "'*'".to_string(),
            Token::Semicolon => "';'".to_string(),
            Token::Eq => "'='".to_string(),
            Token::Ne => "'!='".to_string(),
            Token::Lt => "'<'".to_string(),
            Token::Le => "'<='".to_string(),
            Token::Gt => "'>'".to_string(),
            Token::Ge => "'>='".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semicolon);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ne);
                } else {
                    return Err(Error::bad_input("expected '=' after '!'"));
                }
            }
            '<' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Le);
                } else if chars.next_if_eq(&'>').is_some() {
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            // Doubled quote escapes a literal quote.
                            if chars.next_if_eq(&'\'').is_some() {
                                s.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(ch) => s.push(ch),
                        None => return Err(Error::bad_input("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                if c == '-' {
                    text.push(c);
                    chars.next();
                    if !chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                        return Err(Error::bad_input("expected digits after '-'"));
                    }
                }
                let mut is_float = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        chars.next();
                    } else if d == '.' && !is_float {
                        is_float = true;
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if is_float {
                    let v: f64 = text
                        .parse()
                        .map_err(|_| Error::bad_input(format!("bad number '{}'", text)))?;
                    tokens.push(Token::Float(v));
                } else {
                    let v: i64 = text
                        .parse()
                        .map_err(|_| Error::bad_input(format!("bad number '{}'", text)))?;
                    tokens.push(Token::Int(v));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(Error::bad_input(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }
    Ok(tokens)
}

/// The SQL parser: turns text into a list of statements.
#[derive(Debug, Default)]
pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a semicolon-separated script.
    pub fn parse(&self, sql: &str) -> Result<Vec<Statement>> {
        let tokens = tokenize(sql)?;
        let mut cursor = TokenCursor { tokens, pos: 0 };
        let mut statements = Vec::new();
        loop {
            while cursor.eat(&Token::Semicolon) {}
            if cursor.at_end() {
                break;
            }
            statements.push(cursor.statement()?);
        }
        if statements.is_empty() {
            return Err(Error::bad_input("empty statement"));
        }
        Ok(statements)
    }
}

struct TokenCursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenCursor {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| Error::bad_input("unexpected end of statement"))?;
        self.pos += 1;
        Ok(tok)
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token) -> Result<()> {
        let got = self.next()?;
        if got == tok {
            Ok(())
        } else {
            Err(Error::bad_input(format!(
                "expected {}, found {}",
                tok.describe(),
                got.describe()
            )))
        }
    }

    /// Consume a keyword (case-insensitive) or fail.
    fn expect_keyword(&mut self, word: &str) -> Result<()> {
        if self.eat_keyword(word) {
            Ok(())
        } else {
            Err(Error::bad_input(format!(
                "expected {}, found {}",
                word,
                self.peek().map_or("end of input".to_string(), Token::describe)
            )))
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if let Some(Token::Ident(s)) = self.peek() {
            if s.eq_ignore_ascii_case(word) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn ident(&mut self) -> Result<String> {
        match self.next()? {
            Token::Ident(s) => Ok(s),
            other => Err(Error::bad_input(format!(
                "expected identifier, found {}",
                other.describe()
            ))),
        }
    }

    fn integer(&mut self) -> Result<i64> {
        match self.next()? {
            Token::Int(v) => Ok(v),
            other => Err(Error::bad_input(format!(
                "expected integer, found {}",
                other.describe()
            ))),
        }
    }

    fn statement(&mut self) -> Result<Statement> {
        if self.eat_keyword("CREATE") {
            self.expect_keyword("TABLE")?;
            return self.create_table();
        }
        if self.eat_keyword("DROP") {
            self.expect_keyword("TABLE")?;
            let mut stmt = Statement::new(StatementKind::DropTable);
            stmt.table_name = self.ident()?;
            return Ok(stmt);
        }
        if self.eat_keyword("INSERT") {
            self.expect_keyword("INTO")?;
            return self.insert();
        }
        if self.eat_keyword("SELECT") {
            return self.select();
        }
        if self.eat_keyword("UPDATE") {
            return self.update();
        }
        if self.eat_keyword("DELETE") {
            self.expect_keyword("FROM")?;
            return self.delete();
        }
        if self.eat_keyword("BEGIN") {
            return Ok(Statement::new(StatementKind::Begin));
        }
        if self.eat_keyword("COMMIT") {
            return Ok(Statement::new(StatementKind::Commit));
        }
        if self.eat_keyword("ROLLBACK") {
            return Ok(Statement::new(StatementKind::Rollback));
        }
        Err(Error::bad_input(format!(
            "unrecognized statement start: {}",
            self.peek().map_or("end of input".to_string(), Token::describe)
        )))
    }

    fn create_table(&mut self) -> Result<Statement> {
        let mut stmt = Statement::new(StatementKind::CreateTable);
        stmt.table_name = self.ident()?;
        self.expect(Token::LParen)?;
        loop {
            stmt.columns.push(self.column_def()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen)?;
            break;
        }
        Ok(stmt)
    }

    fn column_def(&mut self) -> Result<Column> {
        let name = self.ident()?;
        let type_name = self.ident()?;
        let mut column = if type_name.eq_ignore_ascii_case("VARCHAR") {
            self.expect(Token::LParen)?;
            let size = self.integer()?;
            self.expect(Token::RParen)?;
            if size <= 0 {
                return Err(Error::bad_input(format!(
                    "varchar size must be positive, got {}",
                    size
                )));
            }
            Column::varchar(name, size as usize)
        } else {
            let kind = match type_name.to_ascii_uppercase().as_str() {
                "BOOLEAN" | "BOOL" => ColumnKind::Bool,
                "INT4" => ColumnKind::Int4,
                "INT8" => ColumnKind::Int8,
                "FLOAT4" => ColumnKind::Float4,
                "FLOAT8" => ColumnKind::Float8,
                other => {
                    return Err(Error::bad_input(format!("unknown column type '{}'", other)))
                }
            };
            Column::new(name, kind)
        };
        loop {
            if self.eat_keyword("PRIMARY") {
                self.expect_keyword("KEY")?;
                column = column.primary_key();
            } else if self.eat_keyword("NULLABLE") {
                column = column.nullable();
            } else {
                break;
            }
        }
        Ok(column)
    }

    fn insert(&mut self) -> Result<Statement> {
        let mut stmt = Statement::new(StatementKind::Insert);
        stmt.table_name = self.ident()?;
        if self.eat(&Token::LParen) {
            loop {
                stmt.insert_columns.push(self.ident()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen)?;
                break;
            }
        }
        self.expect_keyword("VALUES")?;
        loop {
            self.expect(Token::LParen)?;
            let mut row = Vec::new();
            loop {
                row.push(self.literal()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen)?;
                break;
            }
            stmt.inserts.push(row);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(stmt)
    }

    fn select(&mut self) -> Result<Statement> {
        let mut stmt = Statement::new(StatementKind::Select);
        loop {
            if self.eat(&Token::Star) {
                stmt.fields.push(SelectField::All);
            } else if self.eat_keyword("COUNT") {
                self.expect(Token::LParen)?;
                self.expect(Token::Star)?;
                self.expect(Token::RParen)?;
                stmt.fields.push(SelectField::CountAll);
            } else {
                stmt.fields.push(SelectField::Column(self.ident()?));
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect_keyword("FROM")?;
        stmt.table_name = self.ident()?;
        if self.eat_keyword("WHERE") {
            stmt.conditions = self.conditions()?;
        }
        if self.eat_keyword("LIMIT") {
            stmt.limit = self.integer()?;
        }
        if self.eat_keyword("OFFSET") {
            stmt.offset = self.integer()?;
        }
        Ok(stmt)
    }

    fn update(&mut self) -> Result<Statement> {
        let mut stmt = Statement::new(StatementKind::Update);
        stmt.table_name = self.ident()?;
        self.expect_keyword("SET")?;
        loop {
            let column = self.ident()?;
            self.expect(Token::Eq)?;
            let value = self.literal()?;
            stmt.updates.push(Assignment { column, value });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        if self.eat_keyword("WHERE") {
            stmt.conditions = self.conditions()?;
        }
        Ok(stmt)
    }

    fn delete(&mut self) -> Result<Statement> {
        let mut stmt = Statement::new(StatementKind::Delete);
        stmt.table_name = self.ident()?;
        if self.eat_keyword("WHERE") {
            stmt.conditions = self.conditions()?;
        }
        Ok(stmt)
    }

    fn conditions(&mut self) -> Result<Vec<Condition>> {
        let mut conditions = Vec::new();
        loop {
            conditions.push(self.condition()?);
            if !self.eat_keyword("AND") {
                break;
            }
        }
        Ok(conditions)
    }

    fn condition(&mut self) -> Result<Condition> {
        let column = self.ident()?;
        if self.eat_keyword("IS") {
            let op = if self.eat_keyword("NOT") {
                self.expect_keyword("NULL")?;
                CompareOp::IsNotNull
            } else {
                self.expect_keyword("NULL")?;
                CompareOp::IsNull
            };
            return Ok(Condition {
                column,
                op,
                value: Value::Null,
            });
        }
        let op = match self.next()? {
            Token::Eq => CompareOp::Eq,
            Token::Ne => CompareOp::Ne,
            Token::Lt => CompareOp::Lt,
            Token::Le => CompareOp::Le,
            Token::Gt => CompareOp::Gt,
            Token::Ge => CompareOp::Ge,
            other => {
                return Err(Error::bad_input(format!(
                    "expected comparison operator, found {}",
                    other.describe()
                )))
            }
        };
        let value = self.literal()?;
        Ok(Condition { column, op, value })
    }

    fn literal(&mut self) -> Result<Value> {
        if self.eat_keyword("NULL") {
            return Ok(Value::Null);
        }
        if self.eat_keyword("TRUE") {
            return Ok(Value::Bool(true));
        }
        if self.eat_keyword("FALSE") {
            return Ok(Value::Bool(false));
        }
        match self.next()? {
            Token::Int(v) => Ok(Value::Int8(v)),
            Token::Float(v) => Ok(Value::Float8(v)),
            Token::Str(s) => Ok(Value::Varchar(s)),
            other => Err(Error::bad_input(format!(
                "expected literal, found {}",
                other.describe()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(sql: &str) -> Statement {
        let stmts = Parser::new().parse(sql).unwrap();
        assert_eq!(stmts.len(), 1);
        stmts.into_iter().next().unwrap()
    }

    #[test]
    fn create_table_with_modifiers() {
        let stmt = one(
            "create table users (id int8 primary key, email varchar(255), age int4 nullable)",
        );
        assert_eq!(stmt.kind, StatementKind::CreateTable);
        assert_eq!(stmt.table_name, "users");
        assert_eq!(stmt.columns.len(), 3);
        assert!(stmt.columns[0].primary_key);
        assert_eq!(stmt.columns[0].kind, ColumnKind::Int8);
        assert_eq!(stmt.columns[1].kind, ColumnKind::Varchar);
        assert_eq!(stmt.columns[1].size, 255);
        assert!(stmt.columns[2].nullable);
    }

    #[test]
    fn insert_multi_row_with_nulls() {
        let stmt = one("INSERT INTO users (id, email, age) VALUES (1, 'a@x', 30), (2, 'b@x', NULL)");
        assert_eq!(stmt.kind, StatementKind::Insert);
        assert_eq!(stmt.insert_columns, vec!["id", "email", "age"]);
        assert_eq!(stmt.inserts.len(), 2);
        assert_eq!(
            stmt.inserts[1],
            vec![Value::Int8(2), Value::Varchar("b@x".to_string()), Value::Null]
        );
    }

    #[test]
    fn select_with_where_limit_offset() {
        let stmt = one("SELECT id, email FROM users WHERE age >= 18 AND email != 'x' LIMIT 5 OFFSET 2");
        assert_eq!(stmt.kind, StatementKind::Select);
        assert_eq!(
            stmt.fields,
            vec![
                SelectField::Column("id".to_string()),
                SelectField::Column("email".to_string())
            ]
        );
        assert_eq!(stmt.conditions.len(), 2);
        assert_eq!(stmt.conditions[0].op, CompareOp::Ge);
        assert_eq!(stmt.conditions[1].op, CompareOp::Ne);
        assert_eq!(stmt.limit, 5);
        assert_eq!(stmt.offset, 2);
    }

    #[test]
    fn select_count_star_and_null_checks() {
        let stmt = one("SELECT COUNT(*) FROM users WHERE age IS NULL");
        assert_eq!(stmt.fields, vec![SelectField::CountAll]);
        assert_eq!(stmt.conditions[0].op, CompareOp::IsNull);

        let stmt = one("SELECT * FROM users WHERE age IS NOT NULL");
        assert_eq!(stmt.fields, vec![SelectField::All]);
        assert_eq!(stmt.conditions[0].op, CompareOp::IsNotNull);
    }

    #[test]
    fn update_and_delete() {
        let stmt = one("UPDATE users SET age = 31, email = 'c@x' WHERE id = 1");
        assert_eq!(stmt.kind, StatementKind::Update);
        assert_eq!(stmt.updates.len(), 2);
        assert_eq!(stmt.updates[0].value, Value::Int8(31));

        let stmt = one("DELETE FROM users WHERE age < 0");
        assert_eq!(stmt.kind, StatementKind::Delete);
        assert_eq!(stmt.conditions[0].op, CompareOp::Lt);
    }

    #[test]
    fn transaction_verbs_and_scripts() {
        let stmts = Parser::new()
            .parse("BEGIN; INSERT INTO t VALUES (1); COMMIT;")
            .unwrap();
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0].kind, StatementKind::Begin);
        assert_eq!(stmts[2].kind, StatementKind::Commit);

        assert_eq!(one("rollback").kind, StatementKind::Rollback);
    }

    #[test]
    fn literals_cover_the_kinds() {
        let stmt = one("INSERT INTO t VALUES (-5, 2.5, 'it''s', TRUE, FALSE, NULL)");
        assert_eq!(
            stmt.inserts[0],
            vec![
                Value::Int8(-5),
                Value::Float8(2.5),
                Value::Varchar("it's".to_string()),
                Value::Bool(true),
                Value::Bool(false),
                Value::Null,
            ]
        );
    }

    #[test]
    fn errors_name_the_offending_token() {
        assert!(Parser::new().parse("").is_err());
        assert!(Parser::new().parse("SELECT FROM t").is_err());
        assert!(Parser::new().parse("CREATE TABLE t (x int2)").is_err());
        assert!(Parser::new().parse("INSERT INTO t VALUES (1").is_err());
        assert!(Parser::new().parse("SELECT * FROM t WHERE 'a' = 1").is_err());
        assert!(Parser::new().parse("FROB the thing").is_err());
    }

    #[test]
    fn ddl_round_trips_through_the_renderer() {
        let stmt = one("CREATE TABLE users (id INT8 PRIMARY KEY, email VARCHAR(255), age INT4 NULLABLE)");
        let schema =
            crate::schema::TableSchema::new(stmt.table_name.clone(), stmt.columns.clone()).unwrap();
        assert_eq!(one(&schema.to_sql()), stmt);
    }
}
