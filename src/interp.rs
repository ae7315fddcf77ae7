use crate::{*, types::*, expr::*, error::*, pretty::*, evaluator::*};
use std::ops::Range;

// Watch expressions: the C++-like subset a user types to look at a variable.
//
//   expr    := unary (('+' | '-') unary)*
//   unary   := '*' unary | '-' unary | postfix
//   postfix := primary ('.' ident ['(' args ')'] | '[' expr ']')*
//   primary := ident ['(' args ')'] | integer | '(' expr ')'
//
// Container methods the formatters know (a.size(), a.front(), a.begin(), ...) are evaluated by the debugger. Any other
// call becomes a Routine to run in the target; that's only allowed for the outermost call, since the result of
// running code isn't available during compilation.

#[derive(Debug)]
pub struct Expression {
    ast: Vec<ASTNode>,
    root: ASTIdx,
}

impl Expression {
    // Variables the expression refers to, in order of appearance, without duplicates.
    pub fn variables(&self) -> Vec<String> {
        let mut r: Vec<String> = Vec::new();
        for node in &self.ast {
            if let AST::Variable(name) = &node.a {
                if !r.contains(name) {
                    r.push(name.clone());
                }
            }
        }
        r
    }
}

pub fn parse_watch_expression(s: &str) -> Result<Expression> {
    let mut lex = Lexer {input: InputStream {input: s, pos: 0}, next_tokens: Vec::new()};
    let mut expr = Expression {ast: Vec::new(), root: ASTIdx(0)};
    let root = parse_expression(&mut lex, &mut expr)?;
    expr.root = root;
    let (r, t) = lex.peek(1)?;
    if !t.is_eof() {
        return err!(Syntax, "unexpected {:?} after expression at {}", t, r.start);
    }
    Ok(expr)
}

pub struct WatchCompiler;

impl Compiler for WatchCompiler {
    fn referenced_names(&self, text: &str) -> Result<Vec<String>> {
        Ok(parse_watch_expression(text)?.variables())
    }

    fn compile(&self, text: &str, context: &mut EvalContext, locals: &ResolvedLocals) -> Result<Compiled> {
        let expr = parse_watch_expression(text)?;
        let root = &expr.ast[expr.root.0];
        match &root.a {
            AST::Call(function) => {
                let args = eval_args(&expr, &root.children, context, locals)?;
                Ok(Compiled::Routine(Routine {function: function.clone(), receiver: None, args, source: text.to_string()}))
            }
            AST::MethodCall(method) => {
                let receiver = eval_expression(&expr, root.children[0], context, locals)?;
                let args = eval_args(&expr, &root.children[1..], context, locals)?;
                Ok(match call_container_method(&receiver, method, &args, context)? {
                    Some(v) => Compiled::Constant(v),
                    None => Compiled::Routine(Routine {function: method.clone(), receiver: Some(receiver), args, source: text.to_string()}),
                })
            }
            _ => Ok(Compiled::Constant(eval_expression(&expr, expr.root, context, locals)?)),
        }
    }
}

fn eval_args(expr: &Expression, nodes: &[ASTIdx], context: &mut EvalContext, locals: &ResolvedLocals) -> Result<Vec<Value>> {
    let mut r: Vec<Value> = Vec::new();
    for &n in nodes {
        r.push(eval_expression(expr, n, context, locals)?);
    }
    Ok(r)
}

fn eval_expression(expr: &Expression, node_idx: ASTIdx, context: &mut EvalContext, locals: &ResolvedLocals) -> Result<Value> {
    let node = &expr.ast[node_idx.0];
    match &node.a {
        &AST::Literal(x) => Ok(Value::immediate(x as usize, context.types.resolve("long")?)),
        AST::Variable(name) => match locals.get(name) {
            Some(v) => Ok(v.clone()),
            None => err!(NoVariable, "no variable '{}'", name),
        }
        AST::Negate => {
            let v = eval_expression(expr, node.children[0], context, locals)?;
            let x = read_integer(&v, context.memory, "operand of unary '-'")?;
            let Some(x) = x.checked_neg() else { return err!(Runtime, "overflow in -({})", x) };
            Ok(Value::immediate(x as usize, context.types.resolve("long")?))
        }
        AST::Deref => {
            let v = eval_expression(expr, node.children[0], context, locals)?;
            match &v.type_.t {
                Type::Iterator(_) => deref_iterator(&v, context),
                Type::Pointer(pointee) => {
                    let pointee = context.types.resolve(pointee)?;
                    let addr = read_address(&v, context.memory)?;
                    Ok(Value::at_addr(addr, pointee))
                }
                _ => err!(TypeMismatch, "can't dereference {}", v.type_.display_name()),
            }
        }
        AST::Field(name) => {
            let v = eval_expression(expr, node.children[0], context, locals)?;
            let Some(s) = v.type_.t.as_struct() else { return err!(TypeMismatch, "can't access field '{}' of {}", name, v.type_.display_name()) };
            let Some(field) = s.fields.iter().find(|f| &f.name == name) else { return err!(NoVariable, "{} has no field '{}'", v.type_.display_name(), name) };
            let field_type = context.types.resolve(&field.type_name)?;
            Ok(Value::new(get_struct_field(&v.val, field, &field_type)?, field_type))
        }
        AST::Index => {
            let v = eval_expression(expr, node.children[0], context, locals)?;
            let i = eval_expression(expr, node.children[1], context, locals)?;
            let i = read_integer(&i, context.memory, "index")?;
            index_value(&v, i, context)
        }
        AST::MethodCall(method) => {
            let receiver = eval_expression(expr, node.children[0], context, locals)?;
            let args = eval_args(expr, &node.children[1..], context, locals)?;
            match call_container_method(&receiver, method, &args, context)? {
                Some(v) => Ok(v),
                None => err!(NotImplemented, "{}() of {} would need to run in the target, which is only supported for the outermost call", method, receiver.type_.display_name()),
            }
        }
        AST::Call(function) => err!(NotImplemented, "{}() would need to run in the target, which is only supported for the outermost call", function),
        &AST::BinaryOperator(op) => {
            let a = eval_expression(expr, node.children[0], context, locals)?;
            let b = eval_expression(expr, node.children[1], context, locals)?;
            eval_binary_operator(op, a, b, context)
        }
    }
}

fn eval_binary_operator(op: BinaryOperator, a: Value, b: Value, context: &mut EvalContext) -> Result<Value> {
    let sign = match op { BinaryOperator::Add => 1i64, BinaryOperator::Sub => -1 };
    match (&a.type_.t, &b.type_.t) {
        (Type::Iterator(_), t) if t.is_integer() => {
            let k = read_integer(&b, context.memory, "iterator offset")?;
            advance_iterator(&a, k.wrapping_mul(sign))
        }
        (t, Type::Iterator(_)) if t.is_integer() && op == BinaryOperator::Add => {
            let k = read_integer(&a, context.memory, "iterator offset")?;
            advance_iterator(&b, k)
        }
        (Type::Pointer(pointee), t) if t.is_integer() => {
            let size = context.types.resolve(pointee)?.size;
            let k = read_integer(&b, context.memory, "pointer offset")?;
            let addr = read_address(&a, context.memory)?;
            Ok(Value::immediate(addr.wrapping_add((k.wrapping_mul(sign) as usize).wrapping_mul(size)), a.type_.clone()))
        }
        (x, y) if x.is_integer() && y.is_integer() => {
            let (x, y) = (read_integer(&a, context.memory, "operand")?, read_integer(&b, context.memory, "operand")?);
            let r = match op { BinaryOperator::Add => x.checked_add(y), BinaryOperator::Sub => x.checked_sub(y) };
            let Some(r) = r else { return err!(Runtime, "integer overflow in {} {} {}", x, op.symbol(), y) };
            Ok(Value::immediate(r as usize, context.types.resolve("long")?))
        }
        _ => err!(TypeMismatch, "can't apply '{}' to {} and {}", op.symbol(), a.type_.display_name(), b.type_.display_name()),
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
struct ASTIdx(usize);

#[derive(Debug)]
enum AST {
    Literal(i64), // 42
    Variable(String), // a
    Negate, // -x
    Deref, // *it
    BinaryOperator(BinaryOperator), // it + 1
    Field(String), // a.__elems_
    Index, // a[1]
    MethodCall(String), // a.at(0); children: receiver, args
    Call(String), // f(1, a)
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum BinaryOperator {
    Add,
    Sub,
}
impl BinaryOperator {
    fn symbol(self) -> &'static str { match self { Self::Add => "+", Self::Sub => "-" } }
}

#[derive(Debug)]
struct ASTNode {
    range: Range<usize>,
    a: AST,
    children: Vec<ASTIdx>,
}

impl Expression {
    fn add(&mut self, node: ASTNode) -> ASTIdx {
        self.ast.push(node);
        ASTIdx(self.ast.len() - 1)
    }
}

struct InputStream<'a> {
    input: &'a str,
    pos: usize,
}
impl<'a> InputStream<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }
    fn eat(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }
    fn eat_while<F: Fn(char) -> bool>(&mut self, f: F) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !f(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
        let input: &'a str = self.input;
        &input[start..self.pos]
    }
}

struct Lexer<'a> {
    input: InputStream<'a>,
    next_tokens: Vec<(Range<usize>, Token)>,
}
impl<'a> Lexer<'a> {
    // peek(1) to get next token without consuming it, peek(2) for second-next, etc
    fn peek(&mut self, n: usize) -> Result<(Range<usize>, &Token)> {
        while self.next_tokens.len() < n {
            self.input.eat_while(|c| c.is_whitespace());
            let start = self.input.pos;
            let Some(c) = self.input.peek() else {
                self.next_tokens.push((start..start, Token::Eof));
                continue;
            };
            let token = if c.is_ascii_digit() {
                let (radix, digits) = if self.input.input[start..].starts_with("0x") || self.input.input[start..].starts_with("0X") {
                    self.input.pos += 2;
                    (16, self.input.eat_while(|c| c.is_ascii_hexdigit()))
                } else {
                    (10, self.input.eat_while(|c| c.is_ascii_digit()))
                };
                // Integer suffixes, as in C++: 3u, 2ul.
                self.input.eat_while(|c| "uUlL".contains(c));
                if self.input.peek().map_or(false, |c| c.is_alphanumeric() || c == '_') {
                    return err!(Syntax, "bad number literal at {}", start);
                }
                match i64::from_str_radix(digits, radix) {
                    Ok(x) => Token::Integer(x),
                    Err(_) => return err!(Syntax, "bad number literal at {}", start),
                }
            } else if c.is_alphabetic() || c == '_' {
                let mut s = self.input.eat_while(|c| c.is_alphanumeric() || c == '_').to_string();
                // Qualified names, like std::size.
                while self.input.input[self.input.pos..].starts_with("::") {
                    self.input.pos += 2;
                    let part = self.input.eat_while(|c| c.is_alphanumeric() || c == '_');
                    if part.is_empty() {
                        return err!(Syntax, "expected identifier after '::' at {}", self.input.pos);
                    }
                    s.push_str("::");
                    s.push_str(part);
                }
                Token::Identifier(s)
            } else if "+-*.,()[]".contains(c) {
                self.input.eat();
                Token::Char(c)
            } else {
                return err!(Syntax, "unexpected character '{}' at {}", c, start);
            };
            self.next_tokens.push((start..self.input.pos, token));
        }
        let (r, t) = &self.next_tokens[n-1];
        Ok((r.clone(), t))
    }

    fn eat(&mut self, n: usize) -> Result<(Range<usize>, Token)> {
        self.peek(n)?;
        let last = self.next_tokens.drain(..n).last();
        last.ok_or_else(|| error!(Internal, "lexer has no tokens"))
    }

    fn eat_if<F: FnOnce(&Token) -> bool>(&mut self, f: F) -> Result<Option<(Range<usize>, Token)>> {
        Ok(if f(self.peek(1)?.1) {
            Some(self.next_tokens.remove(0))
        } else {
            None
        })
    }

    fn expect<F: FnOnce(&Token) -> bool>(&mut self, what: &str, f: F) -> Result<(Range<usize>, Token)> {
        let (r, t) = self.peek(1)?;
        if !f(t) {
            return err!(Syntax, "expected {}, found {:?} at {}", what, t, r.start);
        }
        self.eat(1)
    }
}

#[derive(Debug, Clone)]
enum Token {
    Char(char), // + - * . , ( ) [ ]
    Integer(i64),
    Identifier(String),
    Eof,
}
impl Token {
    fn is_char(&self, c: char) -> bool { match self { Self::Char(x) if x == &c => true, _ => false } }
    fn is_eof(&self) -> bool { match self { Self::Eof => true, _ => false } }
}

fn parse_expression(lex: &mut Lexer, expr: &mut Expression) -> Result<ASTIdx> {
    let mut left = parse_unary(lex, expr)?;
    loop {
        let op = match lex.peek(1)?.1 {
            Token::Char('+') => BinaryOperator::Add,
            Token::Char('-') => BinaryOperator::Sub,
            _ => break,
        };
        lex.eat(1)?;
        let right = parse_unary(lex, expr)?;
        let range = expr.ast[left.0].range.start..expr.ast[right.0].range.end;
        left = expr.add(ASTNode {range, a: AST::BinaryOperator(op), children: vec![left, right]});
    }
    Ok(left)
}

fn parse_unary(lex: &mut Lexer, expr: &mut Expression) -> Result<ASTIdx> {
    let a = match lex.peek(1)?.1 {
        Token::Char('*') => AST::Deref,
        Token::Char('-') => AST::Negate,
        _ => return parse_postfix(lex, expr),
    };
    let (r, _) = lex.eat(1)?;
    let operand = parse_unary(lex, expr)?;
    let range = r.start..expr.ast[operand.0].range.end;
    Ok(expr.add(ASTNode {range, a, children: vec![operand]}))
}

fn parse_postfix(lex: &mut Lexer, expr: &mut Expression) -> Result<ASTIdx> {
    let mut node = parse_primary(lex, expr)?;
    loop {
        let start = expr.ast[node.0].range.start;
        if lex.eat_if(|t| t.is_char('.'))?.is_some() {
            let (r, t) = lex.expect("field or method name", |t| match t { Token::Identifier(_) => true, _ => false })?;
            let Token::Identifier(name) = t else { return err!(Internal, "expected identifier") };
            let mut n = ASTNode {range: start..r.end, a: AST::Field(name.clone()), children: vec![node]};
            if lex.eat_if(|t| t.is_char('('))?.is_some() {
                n.a = AST::MethodCall(name);
                n.range.end = parse_args(lex, expr, &mut n.children)?;
            }
            node = expr.add(n);
        } else if lex.eat_if(|t| t.is_char('['))?.is_some() {
            let idx = parse_expression(lex, expr)?;
            let (r, _) = lex.expect("']'", |t| t.is_char(']'))?;
            node = expr.add(ASTNode {range: start..r.end, a: AST::Index, children: vec![node, idx]});
        } else {
            break;
        }
    }
    Ok(node)
}

// After '('. Returns the end position of ')'.
fn parse_args(lex: &mut Lexer, expr: &mut Expression, children: &mut Vec<ASTIdx>) -> Result<usize> {
    if let Some((r, _)) = lex.eat_if(|t| t.is_char(')'))? {
        return Ok(r.end);
    }
    loop {
        children.push(parse_expression(lex, expr)?);
        let (r, t) = lex.expect("',' or ')'", |t| t.is_char(',') || t.is_char(')'))?;
        if t.is_char(')') {
            return Ok(r.end);
        }
    }
}

fn parse_primary(lex: &mut Lexer, expr: &mut Expression) -> Result<ASTIdx> {
    let (range, token) = lex.eat(1)?;
    match token {
        Token::Integer(x) => Ok(expr.add(ASTNode {range, a: AST::Literal(x), children: Vec::new()})),
        Token::Identifier(name) => {
            let mut n = ASTNode {range, a: AST::Variable(name.clone()), children: Vec::new()};
            if lex.eat_if(|t| t.is_char('('))?.is_some() {
                n.a = AST::Call(name);
                n.range.end = parse_args(lex, expr, &mut n.children)?;
            }
            Ok(expr.add(n))
        }
        Token::Char('(') => {
            let inner = parse_expression(lex, expr)?;
            lex.expect("')'", |t| t.is_char(')'))?;
            Ok(inner)
        }
        Token::Eof => err!(Syntax, "unexpected end of expression"),
        t => err!(Syntax, "unexpected {:?} at {}", t, range.start),
    }
}
