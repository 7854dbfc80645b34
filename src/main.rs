use std::env;

use anyhow::Result;

use tinyssa::ast::{BinOp, CmpOp, Expr, Stmt};
use tinyssa::il;
use tinyssa::vm::Vm;

/// Compiles a built-in demo program, dumps the generated IL, and runs it.
///
/// `-v` (repeatable) raises the log level; `--no-optimise` dumps the raw
/// SSA form instead, which still carries phi functions and is therefore
/// only printed, not executed.
fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let verbosity = args.iter().filter(|a| a.as_str() == "-v").count();
    let optimise = !args.iter().any(|a| a == "--no-optimise");

    stderrlog::new().verbosity(verbosity + 1).init()?;

    let ast = demo_program();
    let program = if optimise {
        il::compile(&ast)?
    } else {
        il::compile_unoptimised(&ast)?
    };
    println!("{}", program);

    if !optimise {
        return Ok(());
    }

    let mut vm = Vm::new(&program);
    vm.register_native(
        "print",
        Box::new(|args| {
            for arg in args {
                println!("{}", arg);
            }
            None
        }),
    );
    match vm.run()? {
        Some(result) => println!("=> {}", result),
        None => println!("=> (no result)"),
    }
    Ok(())
}

/// Prints fib(0) through fib(10), then returns fib(10).
fn demo_program() -> Stmt {
    let fib = Stmt::block(vec![
        Stmt::if_(
            Expr::cmp(CmpOp::Lt, Expr::var("n"), Expr::int(2)),
            Stmt::ret(Expr::var("n")),
        ),
        Stmt::ret(Expr::bin(
            BinOp::Add,
            Expr::call(
                "fib",
                vec![Expr::bin(BinOp::Sub, Expr::var("n"), Expr::int(1))],
            ),
            Expr::call(
                "fib",
                vec![Expr::bin(BinOp::Sub, Expr::var("n"), Expr::int(2))],
            ),
        )),
    ]);
    Stmt::block(vec![
        Stmt::defun("fib", &["n"], fib),
        Stmt::expr(Expr::assign("i", Expr::int(0))),
        Stmt::while_(
            Expr::cmp(CmpOp::Le, Expr::var("i"), Expr::int(10)),
            Stmt::block(vec![
                Stmt::expr(Expr::call("print", vec![Expr::call("fib", vec![Expr::var("i")])])),
                Stmt::expr(Expr::assign(
                    "i",
                    Expr::bin(BinOp::Add, Expr::var("i"), Expr::int(1)),
                )),
            ]),
        ),
        Stmt::ret(Expr::call("fib", vec![Expr::int(10)])),
    ])
}
