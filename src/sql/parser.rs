//! Recursive-descent parser for the statement shapes entity views need.

use super::ast::{
    BinaryOp, Delete, Expr, FromClause, Insert, Join, JoinKind, OrderBy, Select, SelectItem,
    Statement, TableRef, UnaryOp, Update,
};
use super::lexer::{tokenize, Spanned, Token};
use crate::error::{LixError, Result};
use serde_json::{Number, Value};

/// Words that end an expression or cannot be used as an implicit alias.
const RESERVED: &[&str] = &[
    "select", "from", "where", "group", "order", "by", "limit", "offset", "join", "inner", "left",
    "outer", "on", "as", "set", "values", "and", "or", "not", "is", "in", "like", "null", "insert",
    "into", "update", "delete", "asc", "desc",
];

/// Parse one or more `;`-separated statements.
pub fn parse_statements(sql: &str) -> Result<Vec<Statement>> {
    let mut parser = Parser {
        tokens: tokenize(sql)?,
        pos: 0,
        params: 0,
        len: sql.len(),
    };
    let mut statements = Vec::new();
    loop {
        while parser.eat(&Token::Semicolon) {}
        if parser.peek().is_none() {
            break;
        }
        statements.push(parser.statement()?);
        if parser.peek().is_some() && !parser.eat(&Token::Semicolon) {
            return Err(parser.error("expected ';' between statements"));
        }
    }
    Ok(statements)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    params: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|t| &t.token)
    }

    fn error(&self, message: impl Into<String>) -> LixError {
        LixError::SqlParse {
            offset: self.tokens.get(self.pos).map_or(self.len, |t| t.offset),
            message: message.into(),
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|t| t.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}")))
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", keyword.to_ascii_uppercase())))
        }
    }

    fn identifier(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Word(word)) if !RESERVED.contains(&word.to_ascii_lowercase().as_str()) => {
                self.pos += 1;
                Ok(word)
            }
            Some(Token::QuotedIdent(name)) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    /// `[AS] alias`
    fn alias(&mut self) -> Result<Option<String>> {
        if self.eat_keyword("as") {
            return self.identifier().map(Some);
        }
        match self.peek() {
            Some(Token::Word(word)) if !RESERVED.contains(&word.to_ascii_lowercase().as_str()) => {
                self.identifier().map(Some)
            }
            Some(Token::QuotedIdent(_)) => self.identifier().map(Some),
            _ => Ok(None),
        }
    }

    fn statement(&mut self) -> Result<Statement> {
        if self.is_keyword("select") {
            Ok(Statement::Select(self.select()?))
        } else if self.eat_keyword("insert") {
            self.insert().map(Statement::Insert)
        } else if self.eat_keyword("update") {
            self.update().map(Statement::Update)
        } else if self.eat_keyword("delete") {
            self.delete().map(Statement::Delete)
        } else {
            Err(self.error("expected SELECT, INSERT, UPDATE or DELETE"))
        }
    }

    fn select(&mut self) -> Result<Select> {
        self.expect_keyword("select")?;
        let mut select = Select::default();
        loop {
            select.projection.push(self.select_item()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }

        if self.eat_keyword("from") {
            select.from = Some(self.from_clause()?);
        }
        if self.eat_keyword("where") {
            select.selection = Some(self.expr()?);
        }
        if self.eat_keyword("group") {
            self.expect_keyword("by")?;
            select.group_by = self.expr_list()?;
        }
        if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            loop {
                let expr = self.expr()?;
                let descending = if self.eat_keyword("desc") {
                    true
                } else {
                    self.eat_keyword("asc");
                    false
                };
                select.order_by.push(OrderBy { expr, descending });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        if self.eat_keyword("limit") {
            select.limit = Some(self.expr()?);
            if self.eat_keyword("offset") {
                select.offset = Some(self.expr()?);
            }
        }
        Ok(select)
    }

    fn select_item(&mut self) -> Result<SelectItem> {
        if self.eat(&Token::Star) {
            return Ok(SelectItem::Wildcard);
        }
        if matches!(self.peek(), Some(Token::Word(_)) | Some(Token::QuotedIdent(_)))
            && self.peek_at(1) == Some(&Token::Dot)
            && self.peek_at(2) == Some(&Token::Star)
        {
            let table = self.identifier()?;
            self.pos += 2;
            return Ok(SelectItem::QualifiedWildcard(table));
        }
        let expr = self.expr()?;
        let alias = self.alias()?;
        Ok(SelectItem::Expr { expr, alias })
    }

    fn from_clause(&mut self) -> Result<FromClause> {
        let base = self.table_ref()?;
        let mut joins = Vec::new();
        loop {
            let kind = if self.eat(&Token::Comma) {
                joins.push(Join {
                    kind: JoinKind::Inner,
                    table: self.table_ref()?,
                    on: None,
                });
                continue;
            } else if self.eat_keyword("left") {
                self.eat_keyword("outer");
                JoinKind::Left
            } else if self.eat_keyword("inner") {
                JoinKind::Inner
            } else if self.is_keyword("join") {
                JoinKind::Inner
            } else {
                break;
            };
            self.expect_keyword("join")?;
            let table = self.table_ref()?;
            let on = if self.eat_keyword("on") {
                Some(self.expr()?)
            } else {
                None
            };
            joins.push(Join { kind, table, on });
        }
        Ok(FromClause { base, joins })
    }

    fn table_ref(&mut self) -> Result<TableRef> {
        if self.eat(&Token::LParen) {
            let query = self.select()?;
            self.expect(Token::RParen)?;
            let alias = self
                .alias()?
                .ok_or_else(|| self.error("subquery in FROM needs an alias"))?;
            return Ok(TableRef::Subquery {
                query: Box::new(query),
                alias,
            });
        }
        let name = self.identifier()?;
        let alias = self.alias()?;
        Ok(TableRef::table(name, alias))
    }

    fn insert(&mut self) -> Result<Insert> {
        self.expect_keyword("into")?;
        let table = self.identifier()?;
        let mut columns = Vec::new();
        if self.eat(&Token::LParen) {
            loop {
                columns.push(self.identifier()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RParen)?;
        }
        self.expect_keyword("values")?;
        let mut rows = Vec::new();
        loop {
            self.expect(Token::LParen)?;
            let row = self.expr_list()?;
            self.expect(Token::RParen)?;
            if !columns.is_empty() && row.len() != columns.len() {
                return Err(self.error(format!(
                    "{} values for {} columns",
                    row.len(),
                    columns.len()
                )));
            }
            rows.push(row);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(Insert { table, columns, rows })
    }

    fn update(&mut self) -> Result<Update> {
        let table = self.identifier()?;
        self.expect_keyword("set")?;
        let mut assignments = Vec::new();
        loop {
            let column = self.identifier()?;
            self.expect(Token::Eq)?;
            assignments.push((column, self.expr()?));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let selection = if self.eat_keyword("where") {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(Update {
            table,
            assignments,
            selection,
        })
    }

    fn delete(&mut self) -> Result<Delete> {
        self.expect_keyword("from")?;
        let table = self.identifier()?;
        let selection = if self.eat_keyword("where") {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(Delete { table, selection })
    }

    fn expr_list(&mut self) -> Result<Vec<Expr>> {
        let mut list = vec![self.expr()?];
        while self.eat(&Token::Comma) {
            list.push(self.expr()?);
        }
        Ok(list)
    }

    // --- Expressions, lowest precedence first ---

    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            left = Expr::binary(left, BinaryOp::Or, self.and_expr()?);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("and") {
            left = Expr::binary(left, BinaryOp::And, self.not_expr()?);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.not_expr()?),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.additive()?;

        if self.eat_keyword("is") {
            let negated = self.eat_keyword("not");
            self.expect_keyword("null")?;
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let negated = self.is_keyword("not")
            && matches!(self.peek_at(1), Some(Token::Word(w)) if w.eq_ignore_ascii_case("in") || w.eq_ignore_ascii_case("like"));
        if negated {
            self.pos += 1;
        }
        if self.eat_keyword("in") {
            self.expect(Token::LParen)?;
            let list = self.expr_list()?;
            self.expect(Token::RParen)?;
            return Ok(Expr::InList {
                expr: Box::new(left),
                list,
                negated,
            });
        }
        if self.eat_keyword("like") {
            return Ok(Expr::Like {
                expr: Box::new(left),
                pattern: Box::new(self.additive()?),
                negated,
            });
        }

        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::NotEq,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::LtEq) => BinaryOp::LtEq,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::GtEq) => BinaryOp::GtEq,
            _ => return Ok(left),
        };
        self.pos += 1;
        Ok(Expr::binary(left, op, self.additive()?))
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Plus,
                Some(Token::Minus) => BinaryOp::Minus,
                Some(Token::Concat) => BinaryOp::Concat,
                _ => return Ok(left),
            };
            self.pos += 1;
            left = Expr::binary(left, op, self.multiplicative()?);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Multiply,
                Some(Token::Slash) => BinaryOp::Divide,
                Some(Token::Percent) => BinaryOp::Modulo,
                _ => return Ok(left),
            };
            self.pos += 1;
            left = Expr::binary(left, op, self.unary()?);
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.unary()?),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.next().ok_or_else(|| self.error("unexpected end of input"))?;
        match token {
            Token::Param => {
                let index = self.params;
                self.params += 1;
                Ok(Expr::Param(index))
            }
            Token::String(text) => Ok(Expr::Literal(Value::String(text))),
            Token::Number(text) => parse_number(&text)
                .map(Expr::Literal)
                .ok_or_else(|| self.error(format!("invalid number '{text}'"))),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(Expr::Nested(Box::new(inner)))
            }
            Token::Word(word) if word.eq_ignore_ascii_case("null") => Ok(Expr::Literal(Value::Null)),
            Token::Word(word) if word.eq_ignore_ascii_case("true") => Ok(Expr::Literal(Value::Bool(true))),
            Token::Word(word) if word.eq_ignore_ascii_case("false") => {
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Token::Word(word) if self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                if self.eat(&Token::Star) {
                    self.expect(Token::RParen)?;
                    return Ok(Expr::Function {
                        name: word.to_ascii_lowercase(),
                        args: Vec::new(),
                        wildcard: true,
                    });
                }
                let args = if self.peek() == Some(&Token::RParen) {
                    Vec::new()
                } else {
                    self.expr_list()?
                };
                self.expect(Token::RParen)?;
                Ok(Expr::function(word.to_ascii_lowercase(), args))
            }
            Token::Word(word) if RESERVED.contains(&word.to_ascii_lowercase().as_str()) => {
                self.pos -= 1;
                Err(self.error(format!("unexpected keyword '{word}'")))
            }
            Token::Word(name) | Token::QuotedIdent(name) => {
                if self.eat(&Token::Dot) {
                    let column = self.identifier()?;
                    return Ok(Expr::qualified(name, column));
                }
                Ok(Expr::column(name))
            }
            other => {
                self.pos -= 1;
                Err(self.error(format!("unexpected token {other:?}")))
            }
        }
    }
}

fn parse_number(text: &str) -> Option<Value> {
    if let Ok(int) = text.parse::<i64>() {
        return Some(Value::Number(int.into()));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one(sql: &str) -> Statement {
        let mut statements = parse_statements(sql).unwrap();
        assert_eq!(statements.len(), 1);
        statements.remove(0)
    }

    #[test]
    fn test_parse_select_with_join_and_order() {
        let Statement::Select(select) = one(
            "SELECT a.x AS x, count(*) FROM t a LEFT JOIN u ON a.id = u.id \
             WHERE a.x IS NOT NULL AND u.y IN (1, 2) GROUP BY a.x ORDER BY x DESC LIMIT 5",
        ) else {
            panic!("expected select");
        };
        assert_eq!(select.projection.len(), 2);
        let from = select.from.unwrap();
        assert_eq!(from.base.binding(), "a");
        assert_eq!(from.joins[0].kind, JoinKind::Left);
        assert_eq!(select.group_by.len(), 1);
        assert!(select.order_by[0].descending);
        assert_eq!(select.limit, Some(Expr::Literal(json!(5))));
    }

    #[test]
    fn test_parse_insert_with_params() {
        let Statement::Insert(insert) =
            one("INSERT INTO lix_key_value (key, value) VALUES (?, ?), ('b', 2)")
        else {
            panic!("expected insert");
        };
        assert_eq!(insert.columns, vec!["key", "value"]);
        assert_eq!(insert.rows.len(), 2);
        assert_eq!(insert.rows[0][1], Expr::Param(1));
    }

    #[test]
    fn test_parse_update_and_delete() {
        let statements =
            parse_statements("UPDATE kv SET value = value + 1 WHERE key = 'a'; DELETE FROM kv WHERE key LIKE 'x%'")
                .unwrap();
        assert!(matches!(&statements[0], Statement::Update(u) if u.assignments.len() == 1));
        assert!(matches!(&statements[1], Statement::Delete(d) if d.selection.is_some()));
    }

    #[test]
    fn test_parse_error_has_offset() {
        match parse_statements("SELECT FROM t") {
            Err(LixError::SqlParse { offset, .. }) => assert_eq!(offset, 7),
            other => panic!("unexpected {other:?}"),
        }
    }
}
