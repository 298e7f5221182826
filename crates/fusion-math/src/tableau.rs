// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Additive Runge-Kutta Tableaux
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Butcher tableaux for the additive (IMEX) Runge-Kutta integrator.
//!
//! Each method carries an explicit matrix `Ae`, a diagonally implicit
//! matrix `Ai`, weights `be`/`bi`, abscissae `ce`/`ci` and optional
//! dense-output coefficients `binterp[stage][power]` used by the stage
//! predictor.
//!
//! References: Kennedy & Carpenter (2003) for "3", "4", "5";
//! Pareschi & Russo for "prssp2"; Constantinescu for "2a", "2c", "2e".

use fusion_types::error::{FusionError, FusionResult};

const SQRT2: f64 = std::f64::consts::SQRT_2;

/// Coefficients of one ARK method.
#[derive(Debug, Clone)]
pub struct ButcherTableau {
    pub name: String,
    pub stages: usize,
    /// Row-major `stages x stages`.
    pub ae: Vec<f64>,
    pub ai: Vec<f64>,
    pub be: Vec<f64>,
    pub bi: Vec<f64>,
    pub ce: Vec<f64>,
    pub ci: Vec<f64>,
    /// Order of the dense-output polynomial, 0 when none.
    pub pinterp: usize,
    /// Row-major `stages x pinterp`.
    pub binterpe: Vec<f64>,
    pub binterpi: Vec<f64>,
}

impl ButcherTableau {
    /// Assemble from the two matrices. Missing weights default to the last
    /// row of `ai` (`be` defaults to `bi`); abscissae are row sums; missing
    /// dense-output coefficients default to the weights (`binterpe` to
    /// `binterpi`).
    #[allow(clippy::too_many_arguments)]
    pub fn from_coefficients(
        name: &str,
        stages: usize,
        ae: &[f64],
        ai: &[f64],
        be: Option<&[f64]>,
        bi: Option<&[f64]>,
        pinterp: usize,
        binterpe: Option<&[f64]>,
        binterpi: Option<&[f64]>,
    ) -> FusionResult<Self> {
        let s = stages;
        if s == 0 || ae.len() != s * s || ai.len() != s * s {
            return Err(FusionError::ConfigError(format!(
                "ARK method '{name}': matrices must be {s}x{s}"
            )));
        }
        let check = |v: Option<&[f64]>, len: usize, what: &str| -> FusionResult<()> {
            match v {
                Some(v) if v.len() != len => Err(FusionError::ConfigError(format!(
                    "ARK method '{name}': {what} has length {}, expected {len}",
                    v.len()
                ))),
                _ => Ok(()),
            }
        };
        check(be, s, "be")?;
        check(bi, s, "bi")?;
        check(binterpe, s * pinterp, "binterpe")?;
        check(binterpi, s * pinterp, "binterpi")?;

        let bi: Vec<f64> = match bi {
            Some(b) => b.to_vec(),
            None => ai[(s - 1) * s..].to_vec(),
        };
        let be: Vec<f64> = match be {
            Some(b) => b.to_vec(),
            None => bi.clone(),
        };
        let ce: Vec<f64> = (0..s).map(|i| ae[i * s..(i + 1) * s].iter().sum()).collect();
        let ci: Vec<f64> = (0..s).map(|i| ai[i * s..(i + 1) * s].iter().sum()).collect();

        let (binterpe, binterpi) = if pinterp > 0 {
            let bint: Vec<f64> = match binterpi {
                Some(b) => b.to_vec(),
                None => (0..s * pinterp).map(|k| be[k / pinterp]).collect(),
            };
            let bexp: Vec<f64> = match binterpe {
                Some(b) => b.to_vec(),
                None => bint.clone(),
            };
            (bexp, bint)
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(ButcherTableau {
            name: name.to_string(),
            stages: s,
            ae: ae.to_vec(),
            ai: ai.to_vec(),
            be,
            bi,
            ce,
            ci,
            pinterp,
            binterpe,
            binterpi,
        })
    }

    #[inline]
    pub fn ae(&self, i: usize, j: usize) -> f64 {
        self.ae[i * self.stages + j]
    }

    #[inline]
    pub fn ai(&self, i: usize, j: usize) -> f64 {
        self.ai[i * self.stages + j]
    }

    /// True when stage 0 has no implicit diagonal.
    pub fn explicit_first_stage(&self) -> bool {
        self.ai[0] == 0.0
    }

    pub fn has_dense_output(&self) -> bool {
        self.pinterp > 0
    }

    /// Look up a method by its input-deck name.
    pub fn by_name(name: &str) -> FusionResult<Self> {
        match name {
            "1bee" => Self::from_coefficients(
                name,
                3,
                &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.0],
                &[1.0, 0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.5, 0.5],
                None,
                None,
                1,
                None,
                None,
            ),
            "2a" => Self::from_coefficients(
                name,
                2,
                &[0.0, 0.0, 1.0, 0.0],
                &[0.0, 0.0, 0.5, 0.5],
                None,
                None,
                1,
                None,
                None,
            ),
            "2c" | "2e" => {
                let g = 1.0 - 1.0 / SQRT2;
                let ae_last = if name == "2c" {
                    [0.5, 0.5, 0.0]
                } else {
                    [(3.0 - 2.0 * SQRT2) / 6.0, (3.0 + 2.0 * SQRT2) / 6.0, 0.0]
                };
                let ae = [
                    0.0,
                    0.0,
                    0.0,
                    2.0 - SQRT2,
                    0.0,
                    0.0,
                    ae_last[0],
                    ae_last[1],
                    ae_last[2],
                ];
                let ai = [
                    0.0,
                    0.0,
                    0.0,
                    g,
                    g,
                    0.0,
                    1.0 / (2.0 * SQRT2),
                    1.0 / (2.0 * SQRT2),
                    g,
                ];
                let binterpi = [
                    1.0 / SQRT2,
                    -1.0 / (2.0 * SQRT2),
                    1.0 / SQRT2,
                    -1.0 / (2.0 * SQRT2),
                    1.0 - SQRT2,
                    1.0 / SQRT2,
                ];
                Self::from_coefficients(name, 3, &ae, &ai, None, None, 2, None, Some(&binterpi))
            }
            "prssp2" => Self::from_coefficients(
                name,
                3,
                &[0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.5, 0.5, 0.0],
                &[
                    0.25,
                    0.0,
                    0.0,
                    0.0,
                    0.25,
                    0.0,
                    1.0 / 3.0,
                    1.0 / 3.0,
                    1.0 / 3.0,
                ],
                None,
                None,
                0,
                None,
                None,
            ),
            "3" => Self::kennedy_carpenter_3(),
            "4" => Self::kennedy_carpenter_4(),
            "5" => Self::kennedy_carpenter_5(),
            "rk4" => {
                let a = [
                    0.0, 0.0, 0.0, 0.0, //
                    0.5, 0.0, 0.0, 0.0, //
                    0.0, 0.5, 0.0, 0.0, //
                    0.0, 0.0, 1.0, 0.0,
                ];
                let b = [1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0];
                Self::from_coefficients(name, 4, &a, &a, Some(&b), Some(&b), 0, None, None)
            }
            other => Err(FusionError::ConfigError(format!(
                "unknown ARK method '{other}'"
            ))),
        }
    }

    fn kennedy_carpenter_3() -> FusionResult<Self> {
        let g = 1767732205903. / 4055673282236.;
        let ae = [
            0.0,
            0.0,
            0.0,
            0.0,
            1767732205903. / 2027836641118.,
            0.0,
            0.0,
            0.0,
            5535828885825. / 10492691773637.,
            788022342437. / 10882634858940.,
            0.0,
            0.0,
            6485989280629. / 16251701735622.,
            -4246266847089. / 9704473918619.,
            10755448449292. / 10357097424841.,
            0.0,
        ];
        let ai = [
            0.0,
            0.0,
            0.0,
            0.0,
            g,
            g,
            0.0,
            0.0,
            2746238789719. / 10658868560708.,
            -640167445237. / 6845629431997.,
            g,
            0.0,
            1471266399579. / 7840856788654.,
            -4482444167858. / 7529755066697.,
            11266239266428. / 11593286722821.,
            g,
        ];
        let binterpi = [
            4655552711362. / 22874653954995.,
            -215264564351. / 13552729205753.,
            -18682724506714. / 9892148508045.,
            17870216137069. / 13817060693119.,
            34259539580243. / 13192909600954.,
            -28141676662227. / 17317692491321.,
            584795268549. / 6622622206610.,
            2508943948391. / 7218656332882.,
        ];
        Self::from_coefficients("3", 4, &ae, &ai, None, None, 2, None, Some(&binterpi))
    }

    fn kennedy_carpenter_4() -> FusionResult<Self> {
        #[rustfmt::skip]
        let ae = [
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            1. / 2., 0.0, 0.0, 0.0, 0.0, 0.0,
            13861. / 62500., 6889. / 62500., 0.0, 0.0, 0.0, 0.0,
            -116923316275. / 2393684061468., -2731218467317. / 15368042101831.,
            9408046702089. / 11113171139209., 0.0, 0.0, 0.0,
            -451086348788. / 2902428689909., -2682348792572. / 7519795681897.,
            12662868775082. / 11960479115383., 3355817975965. / 11060851509271., 0.0, 0.0,
            647845179188. / 3216320057751., 73281519250. / 8382639484533.,
            552539513391. / 3454668386233., 3354512671639. / 8306763924573., 4040. / 17871., 0.0,
        ];
        #[rustfmt::skip]
        let ai = [
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            1. / 4., 1. / 4., 0.0, 0.0, 0.0, 0.0,
            8611. / 62500., -1743. / 31250., 1. / 4., 0.0, 0.0, 0.0,
            5012029. / 34652500., -654441. / 2922500., 174375. / 388108., 1. / 4., 0.0, 0.0,
            15267082809. / 155376265600., -71443401. / 120774400., 730878875. / 902184768.,
            2285395. / 8070912., 1. / 4., 0.0,
            82889. / 524892., 0.0, 15625. / 83664., 69875. / 102672., -2260. / 8211., 1. / 4.,
        ];
        #[rustfmt::skip]
        let binterpi = [
            6943876665148. / 7220017795957., -54480133. / 30881146., 6818779379841. / 7100303317025.,
            0.0, 0.0, 0.0,
            7640104374378. / 9702883013639., -11436875. / 14766696., 2173542590792. / 12501825683035.,
            -20649996744609. / 7521556579894., 174696575. / 18121608., -31592104683404. / 5083833661969.,
            8854892464581. / 2390941311638., -12120380. / 966161., 61146701046299. / 7138195549469.,
            -11397109935349. / 6675773540249., 3843. / 706., -17219254887155. / 4939391667607.,
        ];
        Self::from_coefficients("4", 6, &ae, &ai, None, None, 3, None, Some(&binterpi))
    }

    fn kennedy_carpenter_5() -> FusionResult<Self> {
        let g = 41. / 200.;
        #[rustfmt::skip]
        let ae = [
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            41. / 100., 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            367902744464. / 2072280473677., 677623207551. / 8224143866563., 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            1268023523408. / 10340822734521., 0.0, 1029933939417. / 13636558850479., 0.0, 0.0, 0.0, 0.0, 0.0,
            14463281900351. / 6315353703477., 0.0, 66114435211212. / 5879490589093.,
            -54053170152839. / 4284798021562., 0.0, 0.0, 0.0, 0.0,
            14090043504691. / 34967701212078., 0.0, 15191511035443. / 11219624916014.,
            -18461159152457. / 12425892160975., -281667163811. / 9011619295870., 0.0, 0.0, 0.0,
            19230459214898. / 13134317526959., 0.0, 21275331358303. / 2942455364971.,
            -38145345988419. / 4862620318723., -1. / 8., -1. / 8., 0.0, 0.0,
            -19977161125411. / 11928030595625., 0.0, -40795976796054. / 6384907823539.,
            177454434618887. / 12078138498510., 782672205425. / 8267701900261.,
            -69563011059811. / 9646580694205., 7356628210526. / 4942186776405., 0.0,
        ];
        #[rustfmt::skip]
        let ai = [
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            g, g, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            41. / 400., -567603406766. / 11931857230679., g, 0.0, 0.0, 0.0, 0.0, 0.0,
            683785636431. / 9252920307686., 0.0, -110385047103. / 1367015193373., g, 0.0, 0.0, 0.0, 0.0,
            3016520224154. / 10081342136671., 0.0, 30586259806659. / 12414158314087.,
            -22760509404356. / 11113319521817., g, 0.0, 0.0, 0.0,
            218866479029. / 1489978393911., 0.0, 638256894668. / 5436446318841.,
            -1179710474555. / 5321154724896., -60928119172. / 8023461067671., g, 0.0, 0.0,
            1020004230633. / 5715676835656., 0.0, 25762820946817. / 25263940353407.,
            -2161375909145. / 9755907335909., -211217309593. / 5846859502534.,
            -4269925059573. / 7827059040749., g, 0.0,
            -872700587467. / 9133579230613., 0.0, 0.0, 22348218063261. / 9555858737531.,
            -1143369518992. / 8141816002931., -39379526789629. / 19018526304540.,
            32727382324388. / 42900044865799., g,
        ];
        #[rustfmt::skip]
        let binterpi = [
            -17674230611817. / 10670229744614., 43486358583215. / 12773830924787., -9257016797708. / 5021505065439.,
            0.0, 0.0, 0.0,
            0.0, 0.0, 0.0,
            65168852399939. / 7868540260826., -91478233927265. / 11067650958493., 26096422576131. / 11239449250142.,
            15494834004392. / 5936557850923., -79368583304911. / 10890268929626., 92396832856987. / 20362823103730.,
            -99329723586156. / 26959484932159., -12239297817655. / 9152339842473., 30029262896817. / 10175596800299.,
            -19024464361622. / 5461577185407., 115839755401235. / 10719374521269., -26136350496073. / 3983972220547.,
            -6511271360970. / 6095937251113., 5843115559534. / 2180450260947., -5289405421727. / 3760307252460.,
        ];
        Self::from_coefficients("5", 8, &ae, &ai, None, None, 3, None, Some(&binterpi))
    }
}
