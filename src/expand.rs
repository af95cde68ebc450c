//! Macro expansion.
//!
//! Three forms are rewritten into canonical instructions before assembly:
//!
//! * `!macro name(p, ...): body !endmacro` definitions, invoked as
//!   `name(arg, ...)` at the start of a line. An argument wrapped in
//!   `{ ... }` may span several lines and contain commas.
//! * `fun name(params) use (locals) { body }`, a function whose prologue
//!   pushes `locals` and whose epilogue pops them again. A `ret` inside the
//!   body jumps to the epilogue.
//! * `call name use (regs)`, which saves `regs` around a call.
//!
//! Every expansion draws a fresh id, and labels defined inside a macro body
//! are renamed `label$id`. `$` never appears in source identifiers.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::error::CompileError;
use crate::lexer::{lex, Tok, Token};
use crate::syntax::{Loc, Reg};

pub const DEFAULT_MAX_DEPTH: usize = 64;

const PRELUDE: &str = include_str!("prelude.asm");

#[derive(Debug, Clone)]
struct MacroDef {
    params: Vec<String>,
    body: Vec<Token>,
    loc: Loc,
    from_prelude: bool,
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token]) -> Cursor<'a> {
        Cursor { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&'a Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn skip_newlines(&mut self) {
        while let Some(Token { tok: Tok::Newline, .. }) = self.peek() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, tok: Tok, site: Loc) -> Result<&'a Token, CompileError> {
        match self.next() {
            Some(t) if t.tok == tok => Ok(t),
            Some(t) => Err(syntax_error(t.loc, format!("expected `{}`, found `{}`", tok, t.tok))),
            None => Err(syntax_error(site, format!("expected `{}` before end of input", tok))),
        }
    }

    fn ident(&mut self, site: Loc, what: &str) -> Result<(String, Loc), CompileError> {
        match self.next() {
            Some(Token { tok: Tok::Ident(s), loc }) => Ok((s.clone(), *loc)),
            Some(t) => Err(syntax_error(t.loc, format!("expected {}, found `{}`", what, t.tok))),
            None => Err(syntax_error(site, format!("expected {} before end of input", what))),
        }
    }

    /// Parses `a, b, c)` after an opening parenthesis.
    fn name_list(&mut self, site: Loc) -> Result<Vec<(String, Loc)>, CompileError> {
        let mut names = Vec::new();
        if let Some(Token { tok: Tok::RParen, .. }) = self.peek() {
            self.pos += 1;
            return Ok(names);
        }
        loop {
            names.push(self.ident(site, "a name")?);
            match self.next() {
                Some(Token { tok: Tok::Comma, .. }) => continue,
                Some(Token { tok: Tok::RParen, .. }) => return Ok(names),
                Some(t) => {
                    return Err(syntax_error(t.loc, format!("expected `,` or `)`, found `{}`", t.tok)))
                }
                None => return Err(syntax_error(site, "unterminated name list".to_string())),
            }
        }
    }

    fn register_list(&mut self, site: Loc) -> Result<Vec<Reg>, CompileError> {
        self.name_list(site)?
            .into_iter()
            .map(|(name, loc)| {
                Reg::from_name(&name)
                    .ok_or_else(|| syntax_error(loc, format!("`{}` is not a register", name)))
            })
            .collect()
    }
}

fn syntax_error(loc: Loc, msg: String) -> CompileError {
    CompileError::MacroSyntax { loc, msg }
}

fn hygienic(name: &str, id: usize) -> String {
    format!("{}${}", name, id)
}

fn emit_line(out: &mut Vec<Token>, loc: Loc, toks: Vec<Tok>) {
    out.extend(toks.into_iter().map(|tok| Token::new(tok, loc)));
    out.push(Token::new(Tok::Newline, loc));
}

fn ident(s: &str) -> Tok {
    Tok::Ident(s.to_string())
}

fn trim_newlines(tokens: &[Token]) -> &[Token] {
    let is_content = |t: &Token| t.tok != Tok::Newline;
    match tokens.iter().position(is_content) {
        Some(start) => {
            let end = tokens.iter().rposition(is_content).map_or(start, |e| e);
            &tokens[start..=end]
        }
        None => &[],
    }
}

/// Strips one pair of braces when they enclose the whole argument.
fn unwrap_block(arg: &[Token]) -> &[Token] {
    match (arg.first(), arg.last()) {
        (Some(Token { tok: Tok::LBrace, .. }), Some(Token { tok: Tok::RBrace, .. })) => {}
        _ => return arg,
    }
    let mut depth = 0usize;
    for (i, t) in arg.iter().enumerate() {
        match t.tok {
            Tok::LBrace => depth += 1,
            Tok::RBrace => {
                depth -= 1;
                if depth == 0 && i + 1 < arg.len() {
                    return arg;
                }
            }
            _ => {}
        }
    }
    &arg[1..arg.len() - 1]
}

fn finish_arg(arg: &[Token], loc: Loc) -> Result<Vec<Token>, CompileError> {
    let arg = trim_newlines(arg);
    if arg.is_empty() {
        return Err(syntax_error(loc, "empty macro argument".to_string()));
    }
    Ok(unwrap_block(arg).to_vec())
}

/// Parses `arg, arg, ...)` after the opening parenthesis of an invocation.
fn parse_args(cur: &mut Cursor, site: Loc) -> Result<Vec<Vec<Token>>, CompileError> {
    let mut args = Vec::new();
    let mut arg: Vec<Token> = Vec::new();
    let mut depth = 0usize;
    let mut saw_comma = false;
    loop {
        let t = match cur.next() {
            Some(t) => t,
            None => return Err(syntax_error(site, "unterminated argument list".to_string())),
        };
        match t.tok {
            Tok::LParen | Tok::LBrace => {
                depth += 1;
                arg.push(t.clone());
            }
            Tok::RParen if depth == 0 => {
                if saw_comma || !trim_newlines(&arg).is_empty() {
                    args.push(finish_arg(&arg, t.loc)?);
                }
                return Ok(args);
            }
            Tok::RParen | Tok::RBrace => {
                depth = depth.saturating_sub(1);
                arg.push(t.clone());
            }
            Tok::Comma if depth == 0 => {
                args.push(finish_arg(&arg, t.loc)?);
                arg.clear();
                saw_comma = true;
            }
            _ => arg.push(t.clone()),
        }
    }
}

pub struct Expander {
    macros: HashMap<String, MacroDef>,
    next_id: usize,
    max_depth: usize,
    in_fun: bool,
}

impl Default for Expander {
    fn default() -> Self {
        Expander::new()
    }
}

impl Expander {
    /// An expander without the prelude macros.
    pub fn new() -> Expander {
        Expander {
            macros: HashMap::new(),
            next_id: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            in_fun: false,
        }
    }

    pub fn with_prelude() -> Result<Expander, CompileError> {
        let mut expander = Expander::new();
        expander.collect_definitions(lex(PRELUDE)?, true)?;
        Ok(expander)
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Expander {
        self.max_depth = max_depth;
        self
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    /// Collects every macro definition in `tokens`, then expands what remains.
    pub fn expand(&mut self, tokens: Vec<Token>) -> Result<Vec<Token>, CompileError> {
        let rest = self.collect_definitions(tokens, false)?;
        let mut out = Vec::with_capacity(rest.len());
        self.expand_into(&rest, 0, &mut out)?;
        Ok(out)
    }

    fn fresh_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn collect_definitions(
        &mut self,
        tokens: Vec<Token>,
        from_prelude: bool,
    ) -> Result<Vec<Token>, CompileError> {
        let mut rest = Vec::with_capacity(tokens.len());
        let mut cur = Cursor::new(&tokens);
        while let Some(t) = cur.next() {
            if t.tok == Tok::Macro {
                self.parse_definition(&mut cur, t.loc, from_prelude)?;
            } else {
                rest.push(t.clone());
            }
        }
        Ok(rest)
    }

    fn parse_definition(
        &mut self,
        cur: &mut Cursor,
        site: Loc,
        from_prelude: bool,
    ) -> Result<(), CompileError> {
        let (name, loc) = cur.ident(site, "a macro name")?;
        cur.expect(Tok::LParen, site)?;
        let mut params = Vec::new();
        for (param, ploc) in cur.name_list(site)? {
            if params.contains(&param) {
                return Err(syntax_error(ploc, format!("duplicate parameter `{}`", param)));
            }
            params.push(param);
        }
        cur.expect(Tok::Colon, site)?;
        let mut body = Vec::new();
        loop {
            match cur.next() {
                Some(Token { tok: Tok::EndMacro, .. }) => break,
                Some(t) => body.push(t.clone()),
                None => return Err(syntax_error(site, format!("macro `{}` has no `!endmacro`", name))),
            }
        }
        if name == "fun" {
            return Err(syntax_error(loc, "`fun` cannot be redefined".to_string()));
        }
        if let Some(existing) = self.macros.get(&name) {
            if !existing.from_prelude {
                return Err(syntax_error(
                    loc,
                    format!("macro `{}` is already defined at {}", name, existing.loc),
                ));
            }
        }
        debug!("defined macro `{}` with {} parameter(s) at {}", name, params.len(), loc);
        self.macros.insert(
            name,
            MacroDef {
                params,
                body,
                loc,
                from_prelude,
            },
        );
        Ok(())
    }

    fn expand_into(
        &mut self,
        tokens: &[Token],
        depth: usize,
        out: &mut Vec<Token>,
    ) -> Result<(), CompileError> {
        let mut cur = Cursor::new(tokens);
        let mut at_instr = true;
        while let Some(t) = cur.next() {
            match &t.tok {
                Tok::Newline => {
                    at_instr = true;
                    out.push(t.clone());
                }
                Tok::Label(_) => out.push(t.clone()),
                Tok::Ident(name) if at_instr => {
                    at_instr = false;
                    let next = cur.peek().map(|n| &n.tok);
                    let after = cur.peek_at(1).map(|n| &n.tok);
                    match (name.as_str(), next, after) {
                        (_, Some(Tok::LParen), _) => {
                            cur.next();
                            self.expand_invocation(name, t.loc, &mut cur, depth, out)?;
                        }
                        ("fun", Some(Tok::Ident(_)), _) => {
                            self.expand_fun(t.loc, &mut cur, depth, out)?;
                        }
                        ("call", Some(Tok::Ident(_)), Some(Tok::Ident(u))) if u == "use" => {
                            self.expand_call_use(t.loc, &mut cur, out)?;
                        }
                        _ => out.push(t.clone()),
                    }
                }
                Tok::Ident(name) if cur.peek().map(|n| &n.tok) == Some(&Tok::LParen) => {
                    return Err(syntax_error(
                        t.loc,
                        format!("macro invocation `{}(...)` must start its own line", name),
                    ));
                }
                _ => {
                    at_instr = false;
                    out.push(t.clone());
                }
            }
        }
        Ok(())
    }

    fn expand_invocation(
        &mut self,
        name: &str,
        site: Loc,
        cur: &mut Cursor,
        depth: usize,
        out: &mut Vec<Token>,
    ) -> Result<(), CompileError> {
        let args = parse_args(cur, site)?;
        let def = match self.macros.get(name) {
            Some(def) => def.clone(),
            None => {
                return Err(CompileError::MacroArity {
                    loc: site,
                    name: name.to_string(),
                    msg: "no such macro".to_string(),
                })
            }
        };
        if args.len() != def.params.len() {
            return Err(CompileError::MacroArity {
                loc: site,
                name: name.to_string(),
                msg: format!("expects {} argument(s), got {}", def.params.len(), args.len()),
            });
        }
        if depth >= self.max_depth {
            return Err(CompileError::MacroRecursion {
                loc: site,
                name: name.to_string(),
                limit: self.max_depth,
            });
        }

        let id = self.fresh_id();
        debug!("expanding `{}` as #{} at {}", name, id, site);
        let internal: HashSet<&str> = def
            .body
            .iter()
            .filter_map(|t| match &t.tok {
                Tok::Label(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        let mut body = Vec::with_capacity(def.body.len() + 1);
        for t in &def.body {
            let tok = match &t.tok {
                Tok::Ident(s) => {
                    if let Some(i) = def.params.iter().position(|p| p == s) {
                        body.extend(args[i].iter().cloned());
                        continue;
                    }
                    if internal.contains(s.as_str()) {
                        Tok::Ident(hygienic(s, id))
                    } else {
                        t.tok.clone()
                    }
                }
                Tok::Label(s) => Tok::Label(hygienic(s, id)),
                other => other.clone(),
            };
            body.push(Token::new(tok, site));
        }
        body.push(Token::new(Tok::Newline, site));
        self.expand_into(&body, depth + 1, out)
    }

    fn expand_fun(
        &mut self,
        site: Loc,
        cur: &mut Cursor,
        depth: usize,
        out: &mut Vec<Token>,
    ) -> Result<(), CompileError> {
        if self.in_fun {
            return Err(syntax_error(site, "`fun` cannot be nested".to_string()));
        }
        let (name, _) = cur.ident(site, "a function name")?;
        cur.expect(Tok::LParen, site)?;
        let params = cur.register_list(site)?;
        let locals = match cur.peek() {
            Some(Token { tok: Tok::Ident(u), .. }) if u == "use" => {
                cur.next();
                cur.expect(Tok::LParen, site)?;
                cur.register_list(site)?
            }
            _ => Vec::new(),
        };
        if let Some(r) = params.iter().find(|r| locals.contains(r)) {
            return Err(syntax_error(
                site,
                format!("register `{}` is both a parameter and a local of `{}`", r, name),
            ));
        }
        cur.skip_newlines();
        cur.expect(Tok::LBrace, site)?;
        let start = cur.pos;
        let mut nesting = 0usize;
        let end = loop {
            match cur.next() {
                Some(Token { tok: Tok::LBrace, .. }) => nesting += 1,
                Some(Token { tok: Tok::RBrace, .. }) if nesting == 0 => break cur.pos - 1,
                Some(Token { tok: Tok::RBrace, .. }) => nesting -= 1,
                Some(_) => {}
                None => return Err(syntax_error(site, format!("`fun {}` has no closing `}}`", name))),
            }
        };
        if depth >= self.max_depth {
            return Err(CompileError::MacroRecursion {
                loc: site,
                name,
                limit: self.max_depth,
            });
        }

        let id = self.fresh_id();
        let epilogue = hygienic(&format!("{}.epilogue", name), id);
        debug!("expanding `fun {}` as #{} at {}", name, id, site);

        let mut inner = Vec::new();
        self.in_fun = true;
        let result = self.expand_into(&cur.tokens[start..end], depth + 1, &mut inner);
        self.in_fun = false;
        result?;

        emit_line(out, site, vec![Tok::Label(name.clone())]);
        for r in &locals {
            emit_line(out, site, vec![ident("push"), ident(r.name())]);
        }
        let mut at_instr = true;
        for t in inner {
            match &t.tok {
                Tok::Newline => at_instr = true,
                Tok::Label(_) => {}
                Tok::Ident(s) if at_instr && s == "ret" => {
                    out.push(Token::new(ident("jmp"), t.loc));
                    out.push(Token::new(Tok::Ident(epilogue.clone()), t.loc));
                    at_instr = false;
                    continue;
                }
                _ => at_instr = false,
            }
            out.push(t);
        }
        out.push(Token::new(Tok::Newline, site));
        emit_line(out, site, vec![Tok::Label(epilogue)]);
        for r in locals.iter().rev() {
            emit_line(out, site, vec![ident("pop"), ident(r.name())]);
        }
        emit_line(out, site, vec![ident("ret")]);
        Ok(())
    }

    fn expand_call_use(
        &mut self,
        site: Loc,
        cur: &mut Cursor,
        out: &mut Vec<Token>,
    ) -> Result<(), CompileError> {
        let (target, _) = cur.ident(site, "a call target")?;
        cur.next();
        cur.expect(Tok::LParen, site)?;
        let saved = cur.register_list(site)?;
        for r in &saved {
            emit_line(out, site, vec![ident("push"), ident(r.name())]);
        }
        emit_line(out, site, vec![ident("call"), Tok::Ident(target)]);
        for r in saved.iter().rev() {
            emit_line(out, site, vec![ident("pop"), ident(r.name())]);
        }
        Ok(())
    }
}
