//! Built-in `"template"` expression evaluator
//!
//! Expressions are embedded in strings between `{{` and `}}` delimiters. A
//! string that is a single expression evaluates to the expression's typed
//! value; a string mixing text and expressions renders to a string.
//!
//! The expression language covers what transition criteria and context
//! rendering need: dotted context paths with index access, literals,
//! comparisons, `and`/`or`/`not`, and the flow inspection functions
//! `succeeded(..)`, `failed(..)`, `completed(..)`, and `result()`.

use serde_json::Value;

use crate::eval::{EvaluationError, Evaluator};

/// The built-in template evaluator
pub struct TemplateEvaluator;

impl TemplateEvaluator {
    /// Catalog name for registry lookup
    pub const NAME: &'static str = "template";
}

impl Evaluator for TemplateEvaluator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn has_expressions(&self, input: &str) -> bool {
        input.contains("{{")
    }

    fn evaluate_str(&self, input: &str, ctx: &Value) -> Result<Value, EvaluationError> {
        let parts = parse_template(input)?;

        // A lone expression keeps its typed value.
        if let [TemplatePart::Expression(expr)] = parts.as_slice() {
            return eval_expression(expr, input, ctx);
        }

        let mut rendered = String::with_capacity(input.len());

        for part in &parts {
            match part {
                TemplatePart::Static(text) => rendered.push_str(text),
                TemplatePart::Expression(expr) => {
                    let value = eval_expression(expr, input, ctx)?;
                    rendered.push_str(&value_to_text(&value));
                }
            }
        }

        Ok(Value::String(rendered))
    }
}

/// A template part - either static text or an expression to evaluate
#[derive(Debug, PartialEq)]
enum TemplatePart {
    Static(String),
    Expression(String),
}

/// Split a template string into static text and `{{ ... }}` expressions
fn parse_template(input: &str) -> Result<Vec<TemplatePart>, EvaluationError> {
    let mut parts = Vec::new();
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        let (text, tail) = rest.split_at(open);

        if !text.is_empty() {
            parts.push(TemplatePart::Static(text.to_string()));
        }

        let body = &tail[2..];
        let close = body
            .find("}}")
            .ok_or_else(|| EvaluationError::Syntax {
                expr: input.to_string(),
                message: "unterminated expression, expected }}".to_string(),
            })?;

        parts.push(TemplatePart::Expression(body[..close].trim().to_string()));
        rest = &body[close + 2..];
    }

    if !rest.is_empty() {
        parts.push(TemplatePart::Static(rest.to_string()));
    }

    Ok(parts)
}

/// Render a value into interpolated text
fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
}

fn tokenize(expr: &str, template: &str) -> Result<Vec<Token>, EvaluationError> {
    let syntax = |message: String| EvaluationError::Syntax {
        expr: template.to_string(),
        message,
    };

    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];

        match c {
            ' ' | '\t' | '\n' | '\r' => pos += 1,
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                pos += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                pos += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '=' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    pos += 2;
                } else {
                    return Err(syntax("expected == for equality".to_string()));
                }
            }
            '!' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    pos += 2;
                } else {
                    return Err(syntax("expected != for inequality".to_string()));
                }
            }
            '<' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    pos += 2;
                } else {
                    tokens.push(Token::Lt);
                    pos += 1;
                }
            }
            '>' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    pos += 2;
                } else {
                    tokens.push(Token::Gt);
                    pos += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                pos += 1;
                loop {
                    match chars.get(pos) {
                        Some(&ch) if ch == quote => {
                            pos += 1;
                            break;
                        }
                        Some(&ch) => {
                            literal.push(ch);
                            pos += 1;
                        }
                        None => return Err(syntax("unterminated string literal".to_string())),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            '0'..='9' | '-' => {
                let start = pos;
                if c == '-' {
                    pos += 1;
                }
                let mut is_float = false;
                while let Some(&ch) = chars.get(pos) {
                    if ch.is_ascii_digit() {
                        pos += 1;
                    } else if ch == '.' && !is_float && chars.get(pos + 1).is_some_and(|d| d.is_ascii_digit()) {
                        is_float = true;
                        pos += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..pos].iter().collect();
                if is_float {
                    let parsed = text
                        .parse::<f64>()
                        .map_err(|e| syntax(format!("bad number {text:?}: {e}")))?;
                    tokens.push(Token::Float(parsed));
                } else {
                    let parsed = text
                        .parse::<i64>()
                        .map_err(|e| syntax(format!("bad number {text:?}: {e}")))?;
                    tokens.push(Token::Int(parsed));
                }
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = pos;
                while chars
                    .get(pos)
                    .is_some_and(|&ch| ch.is_alphanumeric() || ch == '_')
                {
                    pos += 1;
                }
                tokens.push(Token::Ident(chars[start..pos].iter().collect()));
            }
            _ => return Err(syntax(format!("unexpected character {c:?}"))),
        }
    }

    Ok(tokens)
}

// ============================================================================
// Parser / evaluator
// ============================================================================

struct ExprParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ctx: &'a Value,
    template: &'a str,
}

/// Evaluate one expression body (delimiters already stripped)
fn eval_expression(expr: &str, template: &str, ctx: &Value) -> Result<Value, EvaluationError> {
    let tokens = tokenize(expr, template)?;

    if tokens.is_empty() {
        return Err(EvaluationError::Syntax {
            expr: template.to_string(),
            message: "empty expression".to_string(),
        });
    }

    let mut parser = ExprParser {
        tokens,
        pos: 0,
        ctx,
        template,
    };

    let value = parser.parse_or()?;

    if parser.pos != parser.tokens.len() {
        return Err(parser.syntax("trailing tokens after expression"));
    }

    Ok(value)
}

impl ExprParser<'_> {
    fn syntax(&self, message: &str) -> EvaluationError {
        EvaluationError::Syntax {
            expr: self.template.to_string(),
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
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

    fn parse_or(&mut self) -> Result<Value, EvaluationError> {
        let mut value = self.parse_and()?;

        while self.eat_keyword("or") {
            let rhs = self.parse_and()?;
            value = Value::Bool(crate::eval::is_truthy(&value) || crate::eval::is_truthy(&rhs));
        }

        Ok(value)
    }

    fn parse_and(&mut self) -> Result<Value, EvaluationError> {
        let mut value = self.parse_not()?;

        while self.eat_keyword("and") {
            let rhs = self.parse_not()?;
            value = Value::Bool(crate::eval::is_truthy(&value) && crate::eval::is_truthy(&rhs));
        }

        Ok(value)
    }

    fn parse_not(&mut self) -> Result<Value, EvaluationError> {
        if self.eat_keyword("not") {
            let value = self.parse_not()?;
            return Ok(Value::Bool(!crate::eval::is_truthy(&value)));
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Value, EvaluationError> {
        let lhs = self.parse_primary()?;

        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::Lt) => Token::Lt,
            Some(Token::Le) => Token::Le,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Ge) => Token::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;

        let rhs = self.parse_primary()?;
        self.compare(&op, &lhs, &rhs)
    }

    fn compare(&self, op: &Token, lhs: &Value, rhs: &Value) -> Result<Value, EvaluationError> {
        match op {
            Token::Eq => Ok(Value::Bool(values_equal(lhs, rhs))),
            Token::Ne => Ok(Value::Bool(!values_equal(lhs, rhs))),
            _ => {
                let ordering = match (lhs, rhs) {
                    (Value::Number(a), Value::Number(b)) => {
                        let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                        a.partial_cmp(&b)
                    }
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => None,
                };

                let ordering = ordering.ok_or_else(|| EvaluationError::TypeError {
                    expr: self.template.to_string(),
                    message: format!("cannot order {lhs} and {rhs}"),
                })?;

                let result = match op {
                    Token::Lt => ordering.is_lt(),
                    Token::Le => ordering.is_le(),
                    Token::Gt => ordering.is_gt(),
                    Token::Ge => ordering.is_ge(),
                    _ => unreachable!("comparison operator"),
                };

                Ok(Value::Bool(result))
            }
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(name)) if name == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_primary(&mut self) -> Result<Value, EvaluationError> {
        match self.bump() {
            Some(Token::Int(n)) => Ok(Value::from(n)),
            Some(Token::Float(n)) => Ok(serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::LParen) => {
                let value = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.syntax("expected )"));
                }
                Ok(value)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                _ => {
                    if self.peek() == Some(&Token::LParen) {
                        self.pos += 1;
                        self.parse_call(&name)
                    } else {
                        self.parse_path(name)
                    }
                }
            },
            _ => Err(self.syntax("expected a value")),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Value, EvaluationError> {
        let mut args = Vec::new();

        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                if self.eat(&Token::RParen) {
                    break;
                }
                return Err(self.syntax("expected , or ) in argument list"));
            }
        }

        self.apply_function(name, &args)
    }

    fn apply_function(&self, name: &str, args: &[Value]) -> Result<Value, EvaluationError> {
        match name {
            "succeeded" => self.task_state_check(name, args, &["succeeded"]),
            "failed" => self.task_state_check(name, args, &["failed"]),
            "completed" => {
                self.task_state_check(name, args, &["succeeded", "failed", "canceled"])
            }
            "result" => {
                if !args.is_empty() {
                    return Err(EvaluationError::TypeError {
                        expr: self.template.to_string(),
                        message: "result() takes no arguments".to_string(),
                    });
                }
                Ok(self
                    .ctx
                    .pointer("/__current_task/result")
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            _ => Err(EvaluationError::UnknownFunction {
                name: name.to_string(),
                expr: self.template.to_string(),
            }),
        }
    }

    /// Inspect the serialized flow for the latest state of a task
    fn task_state_check(
        &self,
        name: &str,
        args: &[Value],
        accepted: &[&str],
    ) -> Result<Value, EvaluationError> {
        let task_id = match args {
            [Value::String(id)] => id,
            _ => {
                return Err(EvaluationError::TypeError {
                    expr: self.template.to_string(),
                    message: format!("{name}() takes a single task id string"),
                })
            }
        };

        let state = self
            .ctx
            .pointer(&format!("/__flow/tasks/{task_id}"))
            .and_then(Value::as_u64)
            .and_then(|idx| self.ctx.pointer(&format!("/__flow/sequence/{idx}/state")))
            .and_then(Value::as_str);

        Ok(Value::Bool(
            state.is_some_and(|state| accepted.contains(&state)),
        ))
    }

    fn parse_path(&mut self, root: String) -> Result<Value, EvaluationError> {
        let mut path = root.clone();
        let mut current = match self.ctx.get(&root) {
            Some(value) => value.clone(),
            None => {
                return Err(EvaluationError::UndefinedVariable {
                    path,
                    expr: self.template.to_string(),
                })
            }
        };

        loop {
            if self.eat(&Token::Dot) {
                let field = match self.bump() {
                    Some(Token::Ident(field)) => field,
                    _ => return Err(self.syntax("expected field name after .")),
                };
                path = format!("{path}.{field}");
                current = match current.get(&field) {
                    Some(value) => value.clone(),
                    None => {
                        return Err(EvaluationError::UndefinedVariable {
                            path,
                            expr: self.template.to_string(),
                        })
                    }
                };
            } else if self.eat(&Token::LBracket) {
                let index = match self.bump() {
                    Some(Token::Int(n)) if n >= 0 => n as usize,
                    _ => return Err(self.syntax("expected a non-negative index")),
                };
                if !self.eat(&Token::RBracket) {
                    return Err(self.syntax("expected ]"));
                }
                path = format!("{path}[{index}]");
                current = match current.get(index) {
                    Some(value) => value.clone(),
                    None => {
                        return Err(EvaluationError::UndefinedVariable {
                            path,
                            expr: self.template.to_string(),
                        })
                    }
                };
            } else {
                return Ok(current);
            }
        }
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => lhs == rhs,
    }
}
